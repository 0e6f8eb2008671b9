//! Hardware stand-ins for running the control loop without a microscope.

mod scene;
mod stage;

pub use scene::{SceneConfig, SyntheticScene};
pub use stage::{IssuedCommand, SimulatedStage, StageCommand};
