pub mod guard;
pub mod mfa;

pub use guard::*;
pub use mfa::*;
