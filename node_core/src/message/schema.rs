//! The schema loader boundary (§1, explicitly out of scope as a *parser*): given a type name,
//! produce a [`MessageTemplate`]. The production implementation of this trait - reading a
//! filesystem database of message definitions and parsing them into field trees - lives outside
//! this crate entirely. What ships here is the trait itself plus one concrete, in-memory
//! implementation so the rest of the stack (and its tests) can register templates without a
//! real on-disk database.

use crate::error::{ErrorKind, NodeError};
use crate::message::template::MessageTemplate;
use hashbrown::HashMap;

pub trait SchemaLoader {
    fn load(&self, type_name: &str) -> crate::error::Result<MessageTemplate>;
}

/// Templates registered programmatically ahead of time. This is what the core's own test suite
/// uses in place of a filesystem-backed loader.
#[derive(Default)]
pub struct StaticSchemaLoader {
    templates: HashMap<String, MessageTemplate>,
}

impl StaticSchemaLoader {
    pub fn new() -> StaticSchemaLoader {
        StaticSchemaLoader {
            templates: HashMap::new(),
        }
    }

    pub fn register(&mut self, template: MessageTemplate) -> &mut Self {
        self.templates.insert(template.type_name.clone(), template);
        self
    }
}

impl SchemaLoader for StaticSchemaLoader {
    fn load(&self, type_name: &str) -> crate::error::Result<MessageTemplate> {
        self.templates
            .get(type_name)
            .cloned()
            .ok_or_else(|| NodeError::with_detail(ErrorKind::BadArgument, format!("unknown message type `{}`", type_name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::field::FieldKind;

    #[test]
    fn registered_template_is_retrievable() {
        let mut loader = StaticSchemaLoader::new();
        loader.register(MessageTemplate::new("std_msgs/String", vec![("data".into(), FieldKind::String)]));

        let template = loader.load("std_msgs/String").unwrap();
        assert_eq!(template.type_name, "std_msgs/String");
    }

    #[test]
    fn unknown_type_is_bad_argument() {
        let loader = StaticSchemaLoader::new();
        let err = loader.load("nope/Nope").unwrap_err();
        assert_eq!(err.primary(), ErrorKind::BadArgument);
    }
}
