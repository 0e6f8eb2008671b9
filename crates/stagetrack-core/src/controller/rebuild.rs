use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::{CorrelatorConfig, FocusConfig};
use crate::correlator::Correlator;
use crate::error::{Result, TrackError};

struct RebuildRequest {
    generation: u64,
    correlator: CorrelatorConfig,
    focus: FocusConfig,
}

type RebuildOutput = (u64, Result<Correlator>);

/// Background builder for correlators.
///
/// FFT planning can take seconds and the planner must not run on several
/// threads at once, so all builds happen one at a time on a single worker.
/// Only the most recent request counts: queued older requests are skipped
/// and results of superseded requests are discarded.
pub struct CorrelatorRebuilder {
    tx: Option<mpsc::Sender<RebuildRequest>>,
    rx: mpsc::Receiver<RebuildOutput>,
    latest: u64,
    pending: bool,
    worker: Option<JoinHandle<()>>,
}

impl CorrelatorRebuilder {
    pub fn spawn() -> Result<Self> {
        let (req_tx, req_rx) = mpsc::channel::<RebuildRequest>();
        let (out_tx, out_rx) = mpsc::channel::<RebuildOutput>();

        let worker = std::thread::Builder::new()
            .name("stagetrack-rebuild".into())
            .spawn(move || rebuild_loop(req_rx, out_tx))?;

        Ok(Self {
            tx: Some(req_tx),
            rx: out_rx,
            latest: 0,
            pending: false,
            worker: Some(worker),
        })
    }

    /// Queue a build; returns its generation number.
    pub fn request(&mut self, correlator: &CorrelatorConfig, focus: &FocusConfig) -> Result<u64> {
        self.latest += 1;
        let tx = self
            .tx
            .as_ref()
            .ok_or(TrackError::ChannelClosed("correlator rebuild"))?;
        tx.send(RebuildRequest {
            generation: self.latest,
            correlator: correlator.clone(),
            focus: focus.clone(),
        })
        .map_err(|_| TrackError::ChannelClosed("correlator rebuild"))?;
        self.pending = true;
        debug!(generation = self.latest, "Correlator rebuild requested");
        Ok(self.latest)
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn latest_generation(&self) -> u64 {
        self.latest
    }

    /// Drop interest in any outstanding build.
    pub fn cancel(&mut self) {
        self.latest += 1;
        self.pending = false;
    }

    /// Non-blocking: the result of the latest request, if it has finished.
    pub fn poll(&mut self) -> Option<Result<Correlator>> {
        let mut found = None;
        while let Ok(output) = self.rx.try_recv() {
            if let Some(result) = self.accept(output) {
                found = Some(result);
            }
        }
        found
    }

    /// Block up to `timeout` for the latest request.
    pub fn wait(&mut self, timeout: Duration) -> Option<Result<Correlator>> {
        if !self.pending {
            return None;
        }
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(output) => {
                    if let Some(result) = self.accept(output) {
                        return Some(result);
                    }
                }
                Err(_) => return None,
            }
        }
    }

    fn accept(&mut self, (generation, result): RebuildOutput) -> Option<Result<Correlator>> {
        if generation != self.latest {
            debug!(generation, latest = self.latest, "Discarding superseded correlator");
            return None;
        }
        self.pending = false;
        Some(result)
    }
}

impl Drop for CorrelatorRebuilder {
    fn drop(&mut self) {
        // Closing the request channel ends the worker loop.
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn rebuild_loop(rx: mpsc::Receiver<RebuildRequest>, tx: mpsc::Sender<RebuildOutput>) {
    while let Ok(mut request) = rx.recv() {
        while let Ok(newer) = rx.try_recv() {
            request = newer;
        }
        let result = Correlator::new(&request.correlator, &request.focus);
        if tx.send((request.generation, result)).is_err() {
            break;
        }
    }
}
