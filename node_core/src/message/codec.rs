//! Binary wire codec for message field trees (§4.3/§4.6 data phase). Integers are
//! little-endian; strings are a 4-byte length prefix followed by UTF-8 bytes; arrays are a
//! 4-byte count followed by that many encoded elements; nested messages are inlined with no
//! extra framing, since the receiver already holds a matching template (verified by MD5 during
//! the header phase) and therefore knows the shape to expect.

use crate::error::{ErrorKind, NodeError};
use crate::message::field::{DurationValue, FieldKind, FieldValue, MessageValue, TimeValue};
use crate::message::template::MessageTemplate;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Arrays longer than this are refused outright - the wire format could in principle address
/// up to `u32::MAX` elements, but nothing in this protocol ever needs more than `i32::MAX`, and
/// treating the boundary as invalid avoids accidental multi-gigabyte allocations on a corrupt or
/// hostile length prefix.
// 2^31-1 itself is rejected as bad-argument, so the cap sits one below i32::MAX.
const MAX_ARRAY_LEN: usize = i32::max_value() as usize - 1;

pub fn encode(message: &MessageValue) -> crate::error::Result<Vec<u8>> {
    let mut buf = Vec::new();
    for (_, value) in &message.fields {
        encode_value(value, &mut buf)?;
    }
    Ok(buf)
}

pub fn decode(template: &MessageTemplate, bytes: &[u8]) -> crate::error::Result<MessageValue> {
    let mut cursor = Cursor::new(bytes);
    let mut fields = Vec::with_capacity(template.fields.len());

    for (name, kind) in &template.fields {
        let value = decode_value(kind, &mut cursor)?;
        fields.push((name.clone(), value));
    }

    Ok(MessageValue {
        type_name: template.type_name.clone(),
        fields,
    })
}

fn encode_value(value: &FieldValue, buf: &mut Vec<u8>) -> crate::error::Result<()> {
    match value {
        FieldValue::I8(v) => buf.write_i8(*v).map_err(|e| e.into()),
        FieldValue::I16(v) => buf.write_i16::<LittleEndian>(*v).map_err(|e| e.into()),
        FieldValue::I32(v) => buf.write_i32::<LittleEndian>(*v).map_err(|e| e.into()),
        FieldValue::I64(v) => buf.write_i64::<LittleEndian>(*v).map_err(|e| e.into()),
        FieldValue::U8(v) => buf.write_u8(*v).map_err(|e| e.into()),
        FieldValue::U16(v) => buf.write_u16::<LittleEndian>(*v).map_err(|e| e.into()),
        FieldValue::U32(v) => buf.write_u32::<LittleEndian>(*v).map_err(|e| e.into()),
        FieldValue::U64(v) => buf.write_u64::<LittleEndian>(*v).map_err(|e| e.into()),
        FieldValue::F32(v) => buf.write_f32::<LittleEndian>(*v).map_err(|e| e.into()),
        FieldValue::F64(v) => buf.write_f64::<LittleEndian>(*v).map_err(|e| e.into()),
        FieldValue::Bool(v) => buf.write_u8(if *v { 1 } else { 0 }).map_err(|e| e.into()),
        FieldValue::String(s) => encode_string(s, buf),
        FieldValue::Duration(d) => {
            buf.write_i32::<LittleEndian>(d.secs)?;
            buf.write_i32::<LittleEndian>(d.nsecs).map_err(|e| e.into())
        }
        FieldValue::Time(t) => {
            buf.write_u32::<LittleEndian>(t.secs)?;
            buf.write_u32::<LittleEndian>(t.nsecs).map_err(|e| e.into())
        }
        FieldValue::Message(nested) => {
            for (_, field) in &nested.fields {
                encode_value(field, buf)?;
            }
            Ok(())
        }
        FieldValue::Array(items) => {
            if items.len() > MAX_ARRAY_LEN {
                return Err(NodeError::with_detail(
                    ErrorKind::BadArgument,
                    format!("array length {} exceeds the wire maximum", items.len()),
                ));
            }
            buf.write_u32::<LittleEndian>(items.len() as u32)?;
            for item in items {
                encode_value(item, buf)?;
            }
            Ok(())
        }
    }
}

fn encode_string(s: &str, buf: &mut Vec<u8>) -> crate::error::Result<()> {
    let bytes = s.as_bytes();
    if bytes.len() > MAX_ARRAY_LEN {
        return Err(NodeError::with_detail(
            ErrorKind::BadArgument,
            "string length exceeds the wire maximum",
        ));
    }
    buf.write_u32::<LittleEndian>(bytes.len() as u32)?;
    buf.extend_from_slice(bytes);
    Ok(())
}

fn decode_value(kind: &FieldKind, cursor: &mut Cursor<&[u8]>) -> crate::error::Result<FieldValue> {
    Ok(match kind {
        FieldKind::I8 => FieldValue::I8(cursor.read_i8()?),
        FieldKind::I16 => FieldValue::I16(cursor.read_i16::<LittleEndian>()?),
        FieldKind::I32 => FieldValue::I32(cursor.read_i32::<LittleEndian>()?),
        FieldKind::I64 => FieldValue::I64(cursor.read_i64::<LittleEndian>()?),
        FieldKind::U8 => FieldValue::U8(cursor.read_u8()?),
        FieldKind::U16 => FieldValue::U16(cursor.read_u16::<LittleEndian>()?),
        FieldKind::U32 => FieldValue::U32(cursor.read_u32::<LittleEndian>()?),
        FieldKind::U64 => FieldValue::U64(cursor.read_u64::<LittleEndian>()?),
        FieldKind::F32 => FieldValue::F32(cursor.read_f32::<LittleEndian>()?),
        FieldKind::F64 => FieldValue::F64(cursor.read_f64::<LittleEndian>()?),
        FieldKind::Bool => FieldValue::Bool(cursor.read_u8()? != 0),
        FieldKind::String => FieldValue::String(decode_string(cursor)?),
        FieldKind::Duration => FieldValue::Duration(DurationValue {
            secs: cursor.read_i32::<LittleEndian>()?,
            nsecs: cursor.read_i32::<LittleEndian>()?,
        }),
        FieldKind::Time => FieldValue::Time(TimeValue {
            secs: cursor.read_u32::<LittleEndian>()?,
            nsecs: cursor.read_u32::<LittleEndian>()?,
        }),
        FieldKind::Message(template) => {
            let mut fields = Vec::with_capacity(template.fields.len());
            for (name, field_kind) in &template.fields {
                fields.push((name.clone(), decode_value(field_kind, cursor)?));
            }
            FieldValue::Message(MessageValue {
                type_name: template.type_name.clone(),
                fields,
            })
        }
        FieldKind::Array(inner) => {
            let count = cursor.read_u32::<LittleEndian>()? as usize;
            if count > MAX_ARRAY_LEN {
                return Err(NodeError::with_detail(
                    ErrorKind::ProtocolMalformed,
                    format!("array length {} exceeds the wire maximum", count),
                ));
            }
            let mut items = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                items.push(decode_value(inner, cursor)?);
            }
            FieldValue::Array(items)
        }
    })
}

fn decode_string(cursor: &mut Cursor<&[u8]>) -> crate::error::Result<String> {
    let len = cursor.read_u32::<LittleEndian>()? as usize;
    if len > MAX_ARRAY_LEN {
        return Err(NodeError::with_detail(
            ErrorKind::ProtocolMalformed,
            "string length exceeds the wire maximum",
        ));
    }
    let start = cursor.position() as usize;
    let bytes = cursor.get_ref();
    if start + len > bytes.len() {
        return Err(NodeError::new(ErrorKind::ProtocolMalformed));
    }
    let s = String::from_utf8(bytes[start..start + len].to_vec())
        .map_err(|_| NodeError::new(ErrorKind::ProtocolMalformed))?;
    cursor.set_position((start + len) as u64);
    Ok(s)
}
