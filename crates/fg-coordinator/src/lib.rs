//! Coordinator for fedgrid.
//!
//! Wires combination enumeration, dispatch, experiment tracking and
//! hyperparameter search into the request-level operations a federated
//! collaboration exposes.

pub mod coordinator;
pub mod enumerator;
pub mod status;

pub use coordinator::*;
pub use enumerator::*;
pub use status::*;
