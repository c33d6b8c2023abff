pub mod arena;
pub mod publisher;
pub mod service;
pub mod subscriber;

pub use arena::SlotArena;
pub use publisher::{PublisherRegistry, PublisherSlot};
pub use service::{ServiceCallerRegistry, ServiceCallerSlot, ServiceProviderRegistry, ServiceProviderSlot};
pub use subscriber::{SubscriberEvent, SubscriberRegistry, SubscriberSlot};
