//! Service provider and service caller slots.

use crate::message::{MessageTemplate, MessageValue};
use crate::registry::arena::SlotArena;
use std::time::Duration;

pub struct ServiceProviderSlot {
    pub name: String,
    pub request_template: MessageTemplate,
    pub response_template: MessageTemplate,
    pub md5: String,
    pub on_call: Box<dyn FnMut(&MessageValue) -> crate::error::Result<MessageValue>>,
    pub registered_with_master: bool,
}

impl ServiceProviderSlot {
    pub fn new(
        name: impl Into<String>,
        request_template: MessageTemplate,
        response_template: MessageTemplate,
        md5: impl Into<String>,
        on_call: impl FnMut(&MessageValue) -> crate::error::Result<MessageValue> + 'static,
    ) -> ServiceProviderSlot {
        ServiceProviderSlot {
            name: name.into(),
            request_template,
            response_template,
            md5: md5.into(),
            on_call: Box::new(on_call),
            registered_with_master: false,
        }
    }
}

#[derive(Default)]
pub struct ServiceProviderRegistry {
    slots: SlotArena<ServiceProviderSlot>,
}

impl ServiceProviderRegistry {
    pub fn new() -> ServiceProviderRegistry {
        ServiceProviderRegistry::default()
    }

    pub fn register(&mut self, slot: ServiceProviderSlot) -> usize {
        self.slots.insert(slot)
    }

    pub fn unregister(&mut self, index: usize) -> Option<ServiceProviderSlot> {
        self.slots.remove(index)
    }

    pub fn get(&self, index: usize) -> Option<&ServiceProviderSlot> {
        self.slots.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut ServiceProviderSlot> {
        self.slots.get_mut(index)
    }

    pub fn find_by_name(&self, name: &str) -> Option<usize> {
        self.slots.iter().find(|(_, slot)| slot.name == name).map(|(i, _)| i)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

/// A persistent caller keeps its socket open between calls; a non-persistent one closes after
/// every response. `retry_on_disconnect` resolves the open question over whether an in-flight
/// call should be retried once after a mid-call disconnect - default is fail-fast.
pub struct ServiceCallerSlot {
    pub name: String,
    pub request_template: MessageTemplate,
    pub response_template: MessageTemplate,
    pub md5: String,
    pub persistent: bool,
    pub retry_on_disconnect: bool,
    pub loop_period: Option<Duration>,
    pub next_call_at_micros: u64,
    pub fill_request: Box<dyn FnMut(&mut MessageValue)>,
    pub on_response: Box<dyn FnMut(crate::error::Result<MessageValue>)>,
    pub peer_index: Option<usize>,
}

impl ServiceCallerSlot {
    pub fn new(
        name: impl Into<String>,
        request_template: MessageTemplate,
        response_template: MessageTemplate,
        md5: impl Into<String>,
        fill_request: impl FnMut(&mut MessageValue) + 'static,
        on_response: impl FnMut(crate::error::Result<MessageValue>) + 'static,
    ) -> ServiceCallerSlot {
        ServiceCallerSlot {
            name: name.into(),
            request_template,
            response_template,
            md5: md5.into(),
            persistent: false,
            retry_on_disconnect: false,
            loop_period: None,
            next_call_at_micros: 0,
            fill_request: Box::new(fill_request),
            on_response: Box::new(on_response),
            peer_index: None,
        }
    }
}

#[derive(Default)]
pub struct ServiceCallerRegistry {
    slots: SlotArena<ServiceCallerSlot>,
}

impl ServiceCallerRegistry {
    pub fn new() -> ServiceCallerRegistry {
        ServiceCallerRegistry::default()
    }

    pub fn register(&mut self, slot: ServiceCallerSlot) -> usize {
        self.slots.insert(slot)
    }

    pub fn unregister(&mut self, index: usize) -> Option<ServiceCallerSlot> {
        self.slots.remove(index)
    }

    pub fn get(&self, index: usize) -> Option<&ServiceCallerSlot> {
        self.slots.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut ServiceCallerSlot> {
        self.slots.get_mut(index)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut ServiceCallerSlot)> {
        self.slots.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::field::FieldKind;

    fn template(name: &str) -> MessageTemplate {
        MessageTemplate::new(name, vec![("a".into(), FieldKind::I64)])
    }

    #[test]
    fn provider_lookup_by_name() {
        let mut registry = ServiceProviderRegistry::new();
        let idx = registry.register(ServiceProviderSlot::new(
            "/add_two_ints",
            template("AddTwoIntsRequest"),
            template("AddTwoIntsResponse"),
            "md5",
            |req| Ok(req.clone()),
        ));
        assert_eq!(registry.find_by_name("/add_two_ints"), Some(idx));
        assert_eq!(registry.find_by_name("/nope"), None);
    }

    #[test]
    fn caller_defaults_to_fail_fast_on_disconnect() {
        let slot = ServiceCallerSlot::new("/svc", template("Req"), template("Resp"), "md5", |_| {}, |_| {});
        assert!(!slot.retry_on_disconnect);
        assert!(!slot.persistent);
    }
}
