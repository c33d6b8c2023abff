//! Subscriber slots: one per topic a node listens on. Tracks which publisher URIs the master
//! has told it about and, for each, the peer channel index already open to it - so a
//! `publisherUpdate` that repeats a known URI reuses the existing channel instead of dialing a
//! second connection to the same publisher.

use crate::error::NodeError;
use crate::message::{MessageTemplate, MessageValue};
use crate::registry::arena::SlotArena;
use hashbrown::HashMap;

/// What a subscriber's callback is told: either a decoded message, or that the channel carrying
/// them was torn down with a protocol-level error (MD5 mismatch, disconnect) before another
/// message could arrive.
pub enum SubscriberEvent<'a> {
    Message(&'a MessageValue),
    Error(&'a NodeError),
}

pub struct SubscriberSlot {
    pub topic: String,
    pub message_type: String,
    pub md5: String,
    pub template: MessageTemplate,
    pub on_message: Box<dyn FnMut(SubscriberEvent)>,
    pub peer_by_uri: HashMap<String, usize>,
    pub registered_with_master: bool,
}

impl SubscriberSlot {
    pub fn new(topic: impl Into<String>, template: MessageTemplate, on_message: impl FnMut(SubscriberEvent) + 'static) -> SubscriberSlot {
        SubscriberSlot {
            topic: topic.into(),
            message_type: template.type_name.clone(),
            md5: template.md5.clone(),
            template,
            on_message: Box::new(on_message),
            peer_by_uri: HashMap::new(),
            registered_with_master: false,
        }
    }

    /// Returns the existing peer channel index for `uri` if the subscriber is already connected
    /// to it, resolving the open question in favor of reuse over reconnect.
    pub fn existing_peer_for(&self, uri: &str) -> Option<usize> {
        self.peer_by_uri.get(uri).copied()
    }

    pub fn record_peer(&mut self, uri: impl Into<String>, peer_index: usize) {
        self.peer_by_uri.insert(uri.into(), peer_index);
    }

    pub fn forget_peer(&mut self, uri: &str) {
        self.peer_by_uri.remove(uri);
    }
}

#[derive(Default)]
pub struct SubscriberRegistry {
    slots: SlotArena<SubscriberSlot>,
}

impl SubscriberRegistry {
    pub fn new() -> SubscriberRegistry {
        SubscriberRegistry::default()
    }

    pub fn register(&mut self, slot: SubscriberSlot) -> usize {
        self.slots.insert(slot)
    }

    pub fn unregister(&mut self, index: usize) -> Option<SubscriberSlot> {
        self.slots.remove(index)
    }

    pub fn get(&self, index: usize) -> Option<&SubscriberSlot> {
        self.slots.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut SubscriberSlot> {
        self.slots.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &SubscriberSlot)> {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut SubscriberSlot)> {
        self.slots.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::message::field::FieldKind;
    use std::cell::Cell;
    use std::rc::Rc;

    fn template() -> MessageTemplate {
        MessageTemplate::new("std_msgs/String", vec![("data".into(), FieldKind::String)])
    }

    #[test]
    fn publisher_uri_already_connected_is_reused() {
        let mut slot = SubscriberSlot::new("/chatter", template(), |_| {});
        slot.record_peer("http://host:1234", 7);
        assert_eq!(slot.existing_peer_for("http://host:1234"), Some(7));
        assert_eq!(slot.existing_peer_for("http://other:1"), None);
    }

    #[test]
    fn on_message_callback_fires() {
        let seen = Rc::new(Cell::new(0));
        let seen_clone = seen.clone();
        let mut slot = SubscriberSlot::new("/chatter", template(), move |_event| {
            seen_clone.set(seen_clone.get() + 1);
        });
        let msg = slot.template.instantiate();
        (slot.on_message)(SubscriberEvent::Message(&msg));
        assert_eq!(seen.get(), 1);
    }

    #[test]
    fn error_event_reaches_the_same_callback_as_messages() {
        let last_was_error = Rc::new(Cell::new(false));
        let last_was_error_clone = last_was_error.clone();
        let mut slot = SubscriberSlot::new("/chatter", template(), move |event| {
            last_was_error_clone.set(matches!(event, SubscriberEvent::Error(_)));
        });
        let err = NodeError::new(ErrorKind::ProtocolMd5Mismatch);
        (slot.on_message)(SubscriberEvent::Error(&err));
        assert!(last_was_error.get());
    }
}
