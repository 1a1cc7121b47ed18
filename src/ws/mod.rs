pub mod actor;
pub mod handler;
pub mod protocol;

pub use protocol::{Event, EventType, InboundEvent};
