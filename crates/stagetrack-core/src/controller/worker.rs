use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::config::TrackingConfig;
use crate::error::{Result, TrackError};
use crate::frame::{Axis, Frame};

use super::{Controller, Mode};

/// How often an idle loop checks for a finished correlator rebuild.
const REBUILD_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Requests handled by the control loop between frames.
#[derive(Debug)]
pub enum LoopCommand {
    Start,
    Stop,
    SetMode(Mode),
    SetConfig(Box<TrackingConfig>),
    SetPredictorSize(usize),
    MotionComplete(Axis),
    ArmAutofocusCapture,
    RequestRebuild,
    Shutdown,
}

enum Message {
    Frame(Frame),
    Command(LoopCommand, mpsc::Sender<Result<()>>),
}

/// Worker thread that owns a [`Controller`].
///
/// Frames and commands arrive through one bounded channel and are handled
/// strictly in order. Producers never block on frames: when the channel is
/// full the frame is dropped at the sender.
pub struct ControlLoop;

impl ControlLoop {
    /// Move `controller` onto a new worker. `capacity` frames may wait in
    /// the queue; with 0 a frame is only accepted while the loop is idle.
    pub fn spawn(controller: Controller, capacity: usize) -> Result<LoopHandle> {
        let (tx, rx) = mpsc::sync_channel::<Message>(capacity);
        let worker = std::thread::Builder::new()
            .name("stagetrack-control".into())
            .spawn(move || run_loop(controller, rx))?;
        Ok(LoopHandle {
            tx,
            worker: Some(worker),
        })
    }
}

/// Producer side of a running [`ControlLoop`].
pub struct LoopHandle {
    tx: SyncSender<Message>,
    worker: Option<JoinHandle<Controller>>,
}

impl LoopHandle {
    /// Hand a frame to the loop without blocking. Returns `false` when the
    /// frame was dropped because the loop is busy or gone.
    pub fn offer_frame(&self, frame: Frame) -> bool {
        match self.tx.try_send(Message::Frame(frame)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                trace!("Control loop busy, frame dropped");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Send a command and wait until the loop has applied it.
    pub fn command(&self, command: LoopCommand) -> Result<()> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .send(Message::Command(command, reply_tx))
            .map_err(|_| TrackError::ChannelClosed("control loop"))?;
        reply_rx
            .recv()
            .map_err(|_| TrackError::ChannelClosed("control loop reply"))?
    }

    pub fn start(&self) -> Result<()> {
        self.command(LoopCommand::Start)
    }

    pub fn stop(&self) -> Result<()> {
        self.command(LoopCommand::Stop)
    }

    /// Stop the loop and get the controller back.
    pub fn shutdown(mut self) -> Result<Controller> {
        self.command(LoopCommand::Shutdown)?;
        let worker = self
            .worker
            .take()
            .ok_or(TrackError::ChannelClosed("control loop"))?;
        worker
            .join()
            .map_err(|_| TrackError::ChannelClosed("control loop panicked"))
    }
}

fn run_loop(mut controller: Controller, rx: Receiver<Message>) -> Controller {
    debug!("Control loop started");
    loop {
        let message = if controller.rebuild_pending() {
            match rx.recv_timeout(REBUILD_POLL_INTERVAL) {
                Ok(message) => Some(message),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        } else {
            match rx.recv() {
                Ok(message) => Some(message),
                Err(_) => break,
            }
        };

        if controller.rebuild_pending() {
            if let Err(e) = controller.poll_rebuild() {
                warn!(error = %e, "Correlator rebuild failed");
            }
        }

        match message {
            None => {}
            Some(Message::Frame(frame)) => controller.track_image(&frame),
            Some(Message::Command(LoopCommand::Shutdown, reply)) => {
                controller.stop();
                let _ = reply.send(Ok(()));
                break;
            }
            Some(Message::Command(command, reply)) => {
                let result = apply(&mut controller, command);
                if let Err(e) = &result {
                    debug!(error = %e, "Command refused");
                }
                let _ = reply.send(result);
            }
        }
    }
    debug!("Control loop finished");
    controller
}

fn apply(controller: &mut Controller, command: LoopCommand) -> Result<()> {
    match command {
        LoopCommand::Start => controller.run(),
        LoopCommand::Stop => {
            controller.stop();
            Ok(())
        }
        LoopCommand::SetMode(mode) => controller.set_mode(mode),
        LoopCommand::SetConfig(config) => controller.set_config(*config),
        LoopCommand::SetPredictorSize(size) => {
            controller.set_predictor_size(size);
            Ok(())
        }
        LoopCommand::MotionComplete(axis) => {
            controller.motion_complete(axis);
            Ok(())
        }
        LoopCommand::ArmAutofocusCapture => {
            controller.arm_autofocus_capture();
            Ok(())
        }
        LoopCommand::RequestRebuild => controller.request_rebuild().map(|_| ()),
        LoopCommand::Shutdown => unreachable!("shutdown is handled by the loop"),
    }
}
