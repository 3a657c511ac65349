//! Board event fan-out.

mod events;
mod hub;

pub use events::{DomainEvent, DomainEventType};
pub use hub::{
    BroadcastHub, DeliveryResult, EvictionCause, HubConfig, HubStatsSnapshot, SendFailure,
};
