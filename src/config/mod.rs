pub mod loader;
pub mod models;
pub mod validation;

pub use models::{RouterConfig, RouterSettings};
