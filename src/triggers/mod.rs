//! Inbound paths for events produced outside this process.

mod http;

pub use http::{publish_event, PublishEventResponse};
