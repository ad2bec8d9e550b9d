pub mod keys;
pub mod phase;
pub mod grid;
pub mod alignment;
pub mod statistics;
pub mod experiment;
pub mod job;
pub mod tracking;
pub mod config;
pub mod errors;

pub use keys::*;
pub use phase::*;
pub use grid::*;
pub use alignment::*;
pub use statistics::*;
pub use experiment::*;
pub use job::*;
pub use tracking::*;
pub use config::*;
pub use errors::*;
