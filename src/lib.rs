pub mod alarms;
pub mod config;
pub mod controller;
pub mod error;
pub mod models;
pub mod noise;
pub mod output;
pub mod simulation;
pub mod snapshot;
pub mod state;
pub mod waveform;

pub use config::SimulatorConfig;
pub use controller::{run_session, Action, Ventilator};
pub use error::{VentError, VentResult};
