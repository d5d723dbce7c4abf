pub mod error;
pub mod clock;
pub mod command;
pub mod buffer;
pub mod stream;
pub mod config;
pub mod decode;
pub mod nav;
pub mod solution;
pub mod scint;
pub mod worker;
pub mod server;
pub mod status;
#[cfg(test)]
mod lifecycle_test;
#[cfg(test)]
mod locking_test;

pub use error::*;
pub use config::{ServerConfig, StartOptions};
pub use server::{Collaborators, ResourceReport, Server};
pub use status::{SchedulerStatus, StreamStatus};
pub use worker::{CycleReport, CycleStatistics};
