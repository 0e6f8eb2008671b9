pub mod brenner;
pub mod value;

pub use brenner::{brenner_value, centered_roi, max_intensity, noise_level, FocusMetrics, Roi};
pub use value::{FocusAverager, FocusValue};
