// Infrastructure shared by the scheduler, the runner and the engine

pub mod duration;
pub mod errors;
pub mod limits;
pub mod logging;

pub use errors::{ConvoyError, Result};
pub use limits::{AdmissionController, AdmissionSlot, AdmissionStats};
