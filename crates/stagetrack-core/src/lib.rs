pub mod clock;
pub mod config;
pub mod consts;
pub mod controller;
pub mod correlator;
pub mod error;
pub mod events;
pub mod fft;
pub mod focus;
pub mod focus_tracker;
pub mod frame;
pub mod io;
pub mod sim;
pub mod spectrum;
pub mod stage;
