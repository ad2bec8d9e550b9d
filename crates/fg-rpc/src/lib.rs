pub mod client;
pub mod payload;
pub mod url;

pub use client::*;
pub use payload::*;
pub use url::*;
