//! Experiment tracking for fedgrid.
//!
//! Maps collaborations, projects, experiments and runs onto an external
//! tracking service and replays archived losses and statistics into it.

pub mod bridge;
pub mod file;
pub mod naming;
pub mod rest;
pub mod service;

pub use bridge::*;
pub use file::*;
pub use naming::*;
pub use rest::*;
pub use service::*;
