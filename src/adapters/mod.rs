pub mod message_bus;
pub mod routing_api;

pub use message_bus::{BusMessage, MessageBusAdapter, RegistryMessage};
pub use routing_api::{RoutingApiAdapter, SseEvent, SseParser};
