//! Broker transports implementing [`Connector`](crate::checkin::Connector).

pub mod memory;
pub mod mqtt;

pub use memory::{BrokerEvent, MemoryBroker, MemorySession};
pub use mqtt::{BrokerAddress, MqttConnector, MqttSession};
