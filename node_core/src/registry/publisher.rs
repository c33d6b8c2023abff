//! Publisher slots: one per topic a node advertises. Each slot tracks the peer channels
//! currently fanned out to and whether it has an outstanding `registerPublisher` with the
//! master.

use crate::message::MessageTemplate;
use crate::registry::arena::SlotArena;
use std::time::Duration;

pub struct PublisherSlot {
    pub topic: String,
    pub message_type: String,
    pub md5: String,
    pub queue_size: usize,
    pub loop_period: Option<Duration>,
    pub last_publish_at_micros: u64,
    pub connected_peers: Vec<usize>,
    pub template: MessageTemplate,
    pub registered_with_master: bool,
}

impl PublisherSlot {
    pub fn new(template: MessageTemplate, queue_size: usize, loop_period: Option<Duration>) -> PublisherSlot {
        PublisherSlot {
            topic: String::new(),
            message_type: template.type_name.clone(),
            md5: template.md5.clone(),
            queue_size,
            loop_period,
            last_publish_at_micros: 0,
            connected_peers: Vec::new(),
            template,
            registered_with_master: false,
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> PublisherSlot {
        self.topic = topic.into();
        self
    }
}

#[derive(Default)]
pub struct PublisherRegistry {
    slots: SlotArena<PublisherSlot>,
}

impl PublisherRegistry {
    pub fn new() -> PublisherRegistry {
        PublisherRegistry::default()
    }

    pub fn register(&mut self, slot: PublisherSlot) -> usize {
        self.slots.insert(slot)
    }

    pub fn unregister(&mut self, index: usize) -> Option<PublisherSlot> {
        self.slots.remove(index)
    }

    pub fn get(&self, index: usize) -> Option<&PublisherSlot> {
        self.slots.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut PublisherSlot> {
        self.slots.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &PublisherSlot)> {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut PublisherSlot)> {
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
    use crate::message::field::FieldKind;

    fn template() -> MessageTemplate {
        MessageTemplate::new("std_msgs/String", vec![("data".into(), FieldKind::String)])
    }

    #[test]
    fn register_then_unregister_frees_slot() {
        let mut registry = PublisherRegistry::new();
        let idx = registry.register(PublisherSlot::new(template(), 1, None).with_topic("/chatter"));
        assert_eq!(registry.get(idx).unwrap().topic, "/chatter");
        registry.unregister(idx);
        assert!(registry.get(idx).is_none());
    }
}
