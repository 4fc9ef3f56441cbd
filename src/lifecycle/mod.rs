pub mod drain;

pub use drain::{ConnectionGauge, ConnectionGuard, DrainSignal};
