//! Message templates: the schema-shaped skeleton a [`crate::message::schema::SchemaLoader`]
//! produces once per type name and that every publisher/subscriber/service slot clones from.

use crate::message::field::{FieldKind, MessageValue};
use crate::message::md5;

#[derive(Debug, Clone, PartialEq)]
pub struct MessageTemplate {
    pub type_name: String,
    pub md5: String,
    pub fields: Vec<(String, FieldKind)>,
}

impl MessageTemplate {
    /// Builds a template and computes its MD5 from the canonical textual schema, the way the
    /// middleware's published spec requires: one `<type> <name>` line per field, in declaration
    /// order, hashed as a flat string (nested message fields contribute their own type name,
    /// not their expanded definition - this mirrors the flat-hash scheme real deployments use
    /// for leaf-level type agreement).
    pub fn new(type_name: impl Into<String>, fields: Vec<(String, FieldKind)>) -> MessageTemplate {
        let type_name = type_name.into();
        let text = canonical_text(&fields);
        let md5 = md5::hex_digest(&text);

        MessageTemplate { type_name, md5, fields }
    }

    /// Clone-on-use: produce a fresh, default-valued instance of this type.
    pub fn instantiate(&self) -> MessageValue {
        let fields = self
            .fields
            .iter()
            .map(|(name, kind)| (name.clone(), kind.default_value()))
            .collect();

        MessageValue {
            type_name: self.type_name.clone(),
            fields,
        }
    }

    pub fn field_kind(&self, name: &str) -> Option<&FieldKind> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, k)| k)
    }
}

fn canonical_text(fields: &[(String, FieldKind)]) -> String {
    fields
        .iter()
        .map(|(name, kind)| format!("{} {}", kind.canonical_name(), name))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instantiate_produces_defaults_in_declared_order() {
        let template = MessageTemplate::new(
            "roscpp_tutorials/TwoInts",
            vec![("a".into(), FieldKind::I64), ("b".into(), FieldKind::I64)],
        );

        let instance = template.instantiate();
        assert_eq!(instance.fields.len(), 2);
        assert_eq!(instance.fields[0].0, "a");
        assert_eq!(instance.fields[1].0, "b");
    }

    #[test]
    fn field_order_affects_md5() {
        let a = MessageTemplate::new(
            "t",
            vec![("a".into(), FieldKind::I32), ("b".into(), FieldKind::I32)],
        );
        let b = MessageTemplate::new(
            "t",
            vec![("b".into(), FieldKind::I32), ("a".into(), FieldKind::I32)],
        );

        assert_ne!(a.md5, b.md5);
    }

    #[test]
    fn identical_schema_yields_identical_md5() {
        let a = MessageTemplate::new("std_msgs/String", vec![("data".into(), FieldKind::String)]);
        let b = MessageTemplate::new("std_msgs/String", vec![("data".into(), FieldKind::String)]);
        assert_eq!(a.md5, b.md5);
    }
}
