pub mod body;
pub mod client;
pub mod engine;
pub mod error;
pub mod headers;

pub use client::{AttemptError, BackendClient};
pub use engine::ProxyEngine;
pub use error::ProxyError;
