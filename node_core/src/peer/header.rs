//! The connection header exchanged at the start of every peer data channel: a single
//! length-prefixed block of `key=value` pairs, each itself length-prefixed, describing the
//! topic/service identity and type of the channel about to carry data.

use crate::error::{ErrorKind, NodeError};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

fn malformed(detail: impl Into<String>) -> NodeError {
    NodeError::with_detail(ErrorKind::ProtocolMalformed, detail.into())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelHeader {
    pub topic: String,
    pub message_type: String,
    pub md5: String,
    pub caller_id: String,
    pub latching: bool,
    pub persistent: bool,
}

impl ChannelHeader {
    pub fn encode(&self) -> Vec<u8> {
        let pairs = [
            ("topic", self.topic.clone()),
            ("type", self.message_type.clone()),
            ("md5sum", self.md5.clone()),
            ("callerid", self.caller_id.clone()),
            ("latching", bool_str(self.latching).to_string()),
            ("persistent", bool_str(self.persistent).to_string()),
        ];

        let mut body = Vec::new();
        for (key, value) in &pairs {
            let pair = format!("{}={}", key, value);
            body.write_u32::<LittleEndian>(pair.len() as u32).expect("write to Vec never fails");
            body.extend_from_slice(pair.as_bytes());
        }

        let mut out = Vec::with_capacity(4 + body.len());
        out.write_u32::<LittleEndian>(body.len() as u32).expect("write to Vec never fails");
        out.extend_from_slice(&body);
        out
    }

    pub fn decode(bytes: &[u8]) -> crate::error::Result<ChannelHeader> {
        let mut fields = hashbrown::HashMap::new();
        let mut cursor = Cursor::new(bytes);

        while (cursor.position() as usize) < bytes.len() {
            let pair_len = cursor.read_u32::<LittleEndian>().map_err(|_| malformed("truncated header field length"))? as usize;
            let start = cursor.position() as usize;
            let end = start
                .checked_add(pair_len)
                .filter(|&end| end <= bytes.len())
                .ok_or_else(|| malformed("header field length exceeds buffer"))?;

            let pair_text = std::str::from_utf8(&bytes[start..end]).map_err(|_| malformed("header field is not valid UTF-8"))?;
            let (key, value) = pair_text
                .split_once('=')
                .ok_or_else(|| malformed("header field missing `=`"))?;
            fields.insert(key.to_string(), value.to_string());
            cursor.set_position(end as u64);
        }

        let required = |name: &str| -> crate::error::Result<String> {
            fields
                .get(name)
                .cloned()
                .ok_or_else(|| malformed(format!("header missing `{}`", name)))
        };

        Ok(ChannelHeader {
            topic: required("topic")?,
            message_type: required("type")?,
            md5: required("md5sum")?,
            caller_id: required("callerid")?,
            latching: fields.get("latching").map(|v| v == "1").unwrap_or(false),
            persistent: fields.get("persistent").map(|v| v == "1").unwrap_or(false),
        })
    }
}

fn bool_str(v: bool) -> &'static str {
    if v {
        "1"
    } else {
        "0"
    }
}
