use serde::{Deserialize, Serialize};

/// Stage position in µm.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StagePosition {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Motorised XYZ stage as seen by the controller.
///
/// Move commands return `false` when the hardware rejected them. Relative
/// moves are in µm. Non-blocking moves return immediately; completion is
/// observed through `is_moving_*` or an explicit motion-complete message.
pub trait Stage: Send {
    fn move_xy(&mut self, dx: f64, dy: f64, blocking: bool) -> bool;
    fn move_z(&mut self, dz: f64, blocking: bool) -> bool;
    fn move_to_z(&mut self, z: f64, blocking: bool) -> bool;

    fn x_pos(&self) -> f64;
    fn y_pos(&self) -> f64;
    fn z_pos(&self) -> f64;

    fn is_moving_xy(&self) -> bool;
    fn is_moving_z(&self) -> bool;

    /// Best-effort halt of all axes.
    fn stop_all(&mut self);

    /// Restrict Z travel to a safe window around `center`.
    fn set_z_limits(&mut self, center: f64);
    fn clear_z_limits(&mut self);

    fn position(&self) -> StagePosition {
        StagePosition {
            x: self.x_pos(),
            y: self.y_pos(),
            z: self.z_pos(),
        }
    }
}
