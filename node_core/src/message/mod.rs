pub mod codec;
pub mod field;
pub mod md5;
pub mod schema;
pub mod template;

pub use field::{DurationValue, FieldKind, FieldValue, MessageValue, TimeValue};
pub use schema::{SchemaLoader, StaticSchemaLoader};
pub use template::MessageTemplate;
