use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::clock::Clock;
use crate::frame::Vec2;
use crate::stage::{Stage, StagePosition};

/// One command received by the simulated stage.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StageCommand {
    Xy { dx: f64, dy: f64 },
    Z { dz: f64 },
    ZTo { z: f64 },
}

/// Command plus the time it was issued (µs).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IssuedCommand {
    pub command: StageCommand,
    pub issued_at_us: u64,
}

#[derive(Debug)]
struct PendingMotion {
    command: StageCommand,
    done_at_us: u64,
}

#[derive(Debug)]
struct StageState {
    position: StagePosition,
    latency_us: u64,
    z_limit_half_range: f64,
    z_limits: Option<(f64, f64)>,
    reject_moves: bool,
    pending: VecDeque<PendingMotion>,
    history: Vec<IssuedCommand>,
    stop_count: usize,
}

impl StageState {
    /// Apply every motion that has finished by `now_us`.
    fn settle(&mut self, now_us: u64) {
        while let Some(m) = self.pending.front() {
            if m.done_at_us > now_us {
                break;
            }
            let command = m.command;
            self.pending.pop_front();
            self.apply(command);
        }
    }

    fn apply(&mut self, command: StageCommand) {
        match command {
            StageCommand::Xy { dx, dy } => {
                self.position.x += dx;
                self.position.y += dy;
            }
            StageCommand::Z { dz } => self.position.z += dz,
            StageCommand::ZTo { z } => self.position.z = z,
        }
    }

    /// Z position once all queued motion has finished.
    fn target_z(&self) -> f64 {
        self.pending
            .iter()
            .fold(self.position.z, |z, m| match m.command {
                StageCommand::Z { dz } => z + dz,
                StageCommand::ZTo { z } => z,
                StageCommand::Xy { .. } => z,
            })
    }

    fn z_allowed(&self, z: f64) -> bool {
        self.z_limits.map_or(true, |(lo, hi)| z >= lo && z <= hi)
    }
}

/// Stage simulator with a fixed command-to-motion latency.
///
/// A move becomes visible in the position `latency_us` after it was issued
/// and the axis reports moving until then. Clones share the same state, so
/// a scene renderer can watch the stage the controller drives.
#[derive(Clone)]
pub struct SimulatedStage {
    state: Arc<Mutex<StageState>>,
    clock: Arc<dyn Clock>,
}

impl SimulatedStage {
    pub fn new(clock: Arc<dyn Clock>, latency_us: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(StageState {
                position: StagePosition::default(),
                latency_us,
                z_limit_half_range: 50.0,
                z_limits: None,
                reject_moves: false,
                pending: VecDeque::new(),
                history: Vec::new(),
                stop_count: 0,
            })),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StageState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock and bring the state up to the current time.
    fn settled(&self) -> MutexGuard<'_, StageState> {
        let now = self.clock.now_us();
        let mut state = self.lock();
        state.settle(now);
        state
    }

    pub fn set_position(&self, position: StagePosition) {
        let mut state = self.lock();
        state.pending.clear();
        state.position = position;
    }

    pub fn set_latency_us(&self, latency_us: u64) {
        self.lock().latency_us = latency_us;
    }

    /// Half-width of the Z window installed by `set_z_limits`.
    pub fn set_z_limit_half_range(&self, half_range: f64) {
        self.lock().z_limit_half_range = half_range;
    }

    /// Make every following move command fail.
    pub fn set_reject_moves(&self, reject: bool) {
        self.lock().reject_moves = reject;
    }

    pub fn history(&self) -> Vec<IssuedCommand> {
        self.lock().history.clone()
    }

    /// Sum of all accepted XY commands.
    pub fn commanded_xy(&self) -> Vec2 {
        self.lock()
            .history
            .iter()
            .fold(Vec2::ZERO, |acc, c| match c.command {
                StageCommand::Xy { dx, dy } => acc + Vec2::new(dx, dy),
                _ => acc,
            })
    }

    pub fn stop_count(&self) -> usize {
        self.lock().stop_count
    }

    pub fn z_limits(&self) -> Option<(f64, f64)> {
        self.lock().z_limits
    }

    fn issue(&mut self, command: StageCommand, blocking: bool) -> bool {
        let now = self.clock.now_us();
        let done_at_us = {
            let mut state = self.lock();
            state.settle(now);
            if state.reject_moves {
                return false;
            }
            let z_target = match command {
                StageCommand::Z { dz } => Some(state.target_z() + dz),
                StageCommand::ZTo { z } => Some(z),
                StageCommand::Xy { .. } => None,
            };
            if z_target.is_some_and(|z| !state.z_allowed(z)) {
                return false;
            }
            let done_at_us = now + state.latency_us;
            state.pending.push_back(PendingMotion {
                command,
                done_at_us,
            });
            state.history.push(IssuedCommand {
                command,
                issued_at_us: now,
            });
            done_at_us
        };
        if blocking {
            self.clock.wait_until_us(done_at_us);
            self.lock().settle(done_at_us);
        }
        true
    }
}

impl Stage for SimulatedStage {
    fn move_xy(&mut self, dx: f64, dy: f64, blocking: bool) -> bool {
        self.issue(StageCommand::Xy { dx, dy }, blocking)
    }

    fn move_z(&mut self, dz: f64, blocking: bool) -> bool {
        self.issue(StageCommand::Z { dz }, blocking)
    }

    fn move_to_z(&mut self, z: f64, blocking: bool) -> bool {
        self.issue(StageCommand::ZTo { z }, blocking)
    }

    fn x_pos(&self) -> f64 {
        self.settled().position.x
    }

    fn y_pos(&self) -> f64 {
        self.settled().position.y
    }

    fn z_pos(&self) -> f64 {
        self.settled().position.z
    }

    fn is_moving_xy(&self) -> bool {
        self.settled()
            .pending
            .iter()
            .any(|m| matches!(m.command, StageCommand::Xy { .. }))
    }

    fn is_moving_z(&self) -> bool {
        self.settled()
            .pending
            .iter()
            .any(|m| !matches!(m.command, StageCommand::Xy { .. }))
    }

    fn stop_all(&mut self) {
        let mut state = self.lock();
        state.pending.clear();
        state.stop_count += 1;
    }

    fn set_z_limits(&mut self, center: f64) {
        let mut state = self.lock();
        let half = state.z_limit_half_range;
        state.z_limits = Some((center - half, center + half));
    }

    fn clear_z_limits(&mut self) {
        self.lock().z_limits = None;
    }

    fn position(&self) -> StagePosition {
        self.settled().position
    }
}
