pub mod archival;
pub mod dispatcher;
pub mod queue;
pub mod runner;

pub use archival::*;
pub use dispatcher::*;
pub use queue::*;
pub use runner::*;
