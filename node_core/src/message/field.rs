//! The self-describing field tree that backs every typed message payload.

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeValue {
    pub secs: u32,
    pub nsecs: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DurationValue {
    pub secs: i32,
    pub nsecs: i32,
}

/// One concrete value in a field tree. Exactly the closed set the wire codec knows how to
/// frame: signed/unsigned integers of every width, both float widths, bool, string, duration,
/// time, a nested message, or an array of any of the above.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Bool(bool),
    String(String),
    Duration(DurationValue),
    Time(TimeValue),
    Message(MessageValue),
    Array(Vec<FieldValue>),
}

/// The type-level shape of a field, used by templates to describe a schema without carrying
/// concrete data.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Bool,
    String,
    Duration,
    Time,
    Message(Box<crate::message::template::MessageTemplate>),
    Array(Box<FieldKind>),
}

impl FieldKind {
    /// The zero/default value for this kind, used when a template is instantiated.
    pub fn default_value(&self) -> FieldValue {
        match self {
            FieldKind::I8 => FieldValue::I8(0),
            FieldKind::I16 => FieldValue::I16(0),
            FieldKind::I32 => FieldValue::I32(0),
            FieldKind::I64 => FieldValue::I64(0),
            FieldKind::U8 => FieldValue::U8(0),
            FieldKind::U16 => FieldValue::U16(0),
            FieldKind::U32 => FieldValue::U32(0),
            FieldKind::U64 => FieldValue::U64(0),
            FieldKind::F32 => FieldValue::F32(0.0),
            FieldKind::F64 => FieldValue::F64(0.0),
            FieldKind::Bool => FieldValue::Bool(false),
            FieldKind::String => FieldValue::String(String::new()),
            FieldKind::Duration => FieldValue::Duration(DurationValue { secs: 0, nsecs: 0 }),
            FieldKind::Time => FieldValue::Time(TimeValue { secs: 0, nsecs: 0 }),
            FieldKind::Message(template) => FieldValue::Message(template.instantiate()),
            FieldKind::Array(_) => FieldValue::Array(Vec::new()),
        }
    }

    /// The canonical textual token used when hashing a schema, e.g. `int32`, `string`,
    /// `geometry_msgs/Point`.
    pub fn canonical_name(&self) -> String {
        match self {
            FieldKind::I8 => "int8".into(),
            FieldKind::I16 => "int16".into(),
            FieldKind::I32 => "int32".into(),
            FieldKind::I64 => "int64".into(),
            FieldKind::U8 => "uint8".into(),
            FieldKind::U16 => "uint16".into(),
            FieldKind::U32 => "uint32".into(),
            FieldKind::U64 => "uint64".into(),
            FieldKind::F32 => "float32".into(),
            FieldKind::F64 => "float64".into(),
            FieldKind::Bool => "bool".into(),
            FieldKind::String => "string".into(),
            FieldKind::Duration => "duration".into(),
            FieldKind::Time => "time".into(),
            FieldKind::Message(template) => template.type_name.clone(),
            FieldKind::Array(inner) => format!("{}[]", inner.canonical_name()),
        }
    }
}

/// A named, ordered instance of a message type - a tree of [`FieldValue`]s cloned from a
/// [`crate::message::template::MessageTemplate`].
#[derive(Debug, Clone, PartialEq)]
pub struct MessageValue {
    pub type_name: String,
    pub fields: Vec<(String, FieldValue)>,
}

impl MessageValue {
    /// Linear scan by name - templates rarely carry more than a handful of fields, so this is
    /// cheaper than a hash map in practice and keeps field order significant for the codec.
    pub fn get_field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn get_field_mut(&mut self, name: &str) -> Option<&mut FieldValue> {
        self.fields.iter_mut().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn set_field(&mut self, name: &str, value: FieldValue) -> bool {
        match self.get_field_mut(name) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }
}
