//! A small, purpose-built XML-RPC reader/writer. This is not a general XML document model -
//! per §1 the XML encoder/decoder for arbitrary payloads is an external collaborator - it only
//! understands the closed grammar the master/peer RPC surfaces actually use: method calls,
//! method responses, faults, and the `int`/`i4`/`double`/`string`/`boolean`/`array`/`struct`
//! value types.

use crate::error::{ErrorKind, NodeError};
use crate::xmlrpc::value::Value;

fn malformed(detail: impl Into<String>) -> NodeError {
    NodeError::with_detail(ErrorKind::ProtocolMalformed, detail.into())
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn unescape(s: &str) -> String {
    s.replace("&lt;", "<").replace("&gt;", ">").replace("&amp;", "&")
}

pub fn encode_method_call(method_name: &str, params: &[Value]) -> String {
    let mut out = String::from("<?xml version=\"1.0\"?><methodCall><methodName>");
    out.push_str(&escape(method_name));
    out.push_str("</methodName><params>");
    for param in params {
        out.push_str("<param>");
        encode_value(param, &mut out);
        out.push_str("</param>");
    }
    out.push_str("</params></methodCall>");
    out
}

pub fn encode_method_response(params: &[Value]) -> String {
    let mut out = String::from("<?xml version=\"1.0\"?><methodResponse><params>");
    for param in params {
        out.push_str("<param>");
        encode_value(param, &mut out);
        out.push_str("</param>");
    }
    out.push_str("</params></methodResponse>");
    out
}

pub fn encode_fault_response(fault_code: i32, fault_string: &str) -> String {
    let fault = Value::Struct(vec![
        ("faultCode".into(), Value::Int(fault_code)),
        ("faultString".into(), Value::Str(fault_string.to_string())),
    ]);
    let mut out = String::from("<?xml version=\"1.0\"?><methodResponse><fault>");
    encode_value(&fault, &mut out);
    out.push_str("</fault></methodResponse>");
    out
}

pub fn decode_method_call(xml: &str) -> crate::error::Result<(String, Vec<Value>)> {
    let mut cursor = Cursor::new(xml);
    cursor.consume("<methodCall>")?;
    let method_name = unescape(&cursor.read_leaf("methodName")?);
    let params = parse_params(&mut cursor)?;
    cursor.consume("</methodCall>")?;
    Ok((method_name, params))
}

pub fn decode_method_response(xml: &str) -> crate::error::Result<Vec<Value>> {
    let mut cursor = Cursor::new(xml);
    cursor.consume("<methodResponse>")?;

    if cursor.peek("<fault>") {
        cursor.consume("<fault>")?;
        let fault = parse_value(&mut cursor)?;
        cursor.consume("</fault>")?;
        cursor.consume("</methodResponse>")?;

        let code = fault.struct_field("faultCode").and_then(Value::as_int).unwrap_or(-1);
        let message = fault
            .struct_field("faultString")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        return Err(NodeError::with_detail(
            ErrorKind::RpcMethodFailed,
            format!("fault {}: {}", code, message),
        ));
    }

    let params = parse_params(&mut cursor)?;
    cursor.consume("</methodResponse>")?;
    Ok(params)
}

fn encode_value(value: &Value, out: &mut String) {
    out.push_str("<value>");
    match value {
        Value::Int(v) => {
            out.push_str("<int>");
            out.push_str(&v.to_string());
            out.push_str("</int>");
        }
        Value::Double(v) => {
            out.push_str("<double>");
            out.push_str(&format!("{}", v));
            out.push_str("</double>");
        }
        Value::Str(v) => {
            out.push_str("<string>");
            out.push_str(&escape(v));
            out.push_str("</string>");
        }
        Value::Bool(v) => {
            out.push_str("<boolean>");
            out.push_str(if *v { "1" } else { "0" });
            out.push_str("</boolean>");
        }
        Value::Array(items) => {
            out.push_str("<array><data>");
            for item in items {
                encode_value(item, out);
            }
            out.push_str("</data></array>");
        }
        Value::Struct(members) => {
            out.push_str("<struct>");
            for (name, member_value) in members {
                out.push_str("<member><name>");
                out.push_str(&escape(name));
                out.push_str("</name>");
                encode_value(member_value, out);
                out.push_str("</member>");
            }
            out.push_str("</struct>");
        }
    }
    out.push_str("</value>");
}

fn parse_params(cursor: &mut Cursor) -> crate::error::Result<Vec<Value>> {
    cursor.consume("<params>")?;
    let mut params = Vec::new();
    while !cursor.peek("</params>") {
        cursor.consume("<param>")?;
        params.push(parse_value(cursor)?);
        cursor.consume("</param>")?;
    }
    cursor.consume("</params>")?;
    Ok(params)
}

fn parse_value(cursor: &mut Cursor) -> crate::error::Result<Value> {
    cursor.consume("<value>")?;

    let value = if cursor.peek("<int>") {
        Value::Int(parse_int(&cursor.read_leaf("int")?)?)
    } else if cursor.peek("<i4>") {
        Value::Int(parse_int(&cursor.read_leaf("i4")?)?)
    } else if cursor.peek("<double>") {
        Value::Double(
            cursor
                .read_leaf("double")?
                .parse()
                .map_err(|_| malformed("invalid double literal"))?,
        )
    } else if cursor.peek("<boolean>") {
        Value::Bool(cursor.read_leaf("boolean")? == "1")
    } else if cursor.peek("<string>") {
        Value::Str(unescape(&cursor.read_leaf("string")?))
    } else if cursor.peek("<array>") {
        parse_array(cursor)?
    } else if cursor.peek("<struct>") {
        parse_struct(cursor)?
    } else {
        return Err(malformed("unrecognized value type"));
    };

    cursor.consume("</value>")?;
    Ok(value)
}

fn parse_int(s: &str) -> crate::error::Result<i32> {
    s.trim().parse().map_err(|_| malformed("invalid int literal"))
}

fn parse_array(cursor: &mut Cursor) -> crate::error::Result<Value> {
    cursor.consume("<array>")?;
    cursor.consume("<data>")?;
    let mut items = Vec::new();
    while !cursor.peek("</data>") {
        items.push(parse_value(cursor)?);
    }
    cursor.consume("</data>")?;
    cursor.consume("</array>")?;
    Ok(Value::Array(items))
}

fn parse_struct(cursor: &mut Cursor) -> crate::error::Result<Value> {
    cursor.consume("<struct>")?;
    let mut members = Vec::new();
    while !cursor.peek("</struct>") {
        cursor.consume("<member>")?;
        let name = unescape(&cursor.read_leaf("name")?);
        let value = parse_value(cursor)?;
        cursor.consume("</member>")?;
        members.push((name, value));
    }
    cursor.consume("</struct>")?;
    Ok(Value::Struct(members))
}

/// A cursor over the remaining unparsed XML text. Every method trims leading whitespace before
/// matching, which is all the "skip insignificant text" the closed grammar needs.
struct Cursor<'a> {
    rest: &'a str,
}

impl<'a> Cursor<'a> {
    fn new(xml: &'a str) -> Cursor<'a> {
        let trimmed = xml.trim_start();
        let trimmed = if trimmed.starts_with("<?xml") {
            match trimmed.find("?>") {
                Some(idx) => trimmed[idx + 2..].trim_start(),
                None => trimmed,
            }
        } else {
            trimmed
        };
        Cursor { rest: trimmed }
    }

    fn peek(&self, prefix: &str) -> bool {
        self.rest.trim_start().starts_with(prefix)
    }

    fn consume(&mut self, prefix: &str) -> crate::error::Result<()> {
        let trimmed = self.rest.trim_start();
        match trimmed.strip_prefix(prefix) {
            Some(rest) => {
                self.rest = rest;
                Ok(())
            }
            None => Err(malformed(format!("expected `{}`", prefix))),
        }
    }

    /// Reads `<tag>...</tag>` and returns the raw (still-escaped) inner text.
    fn read_leaf(&mut self, tag: &str) -> crate::error::Result<String> {
        self.consume(&format!("<{}>", tag))?;
        let close = format!("</{}>", tag);
        let idx = self.rest.find(&close).ok_or_else(|| malformed(format!("unterminated <{}>", tag)))?;
        let content = self.rest[..idx].to_string();
        self.rest = &self.rest[idx + close.len()..];
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_call_roundtrips() {
        let params = vec![Value::Str("/chatter".into()), Value::Int(7)];
        let xml = encode_method_call("registerPublisher", &params);
        let (name, decoded) = decode_method_call(&xml).unwrap();
        assert_eq!(name, "registerPublisher");
        assert_eq!(decoded, params);
    }

    #[test]
    fn method_response_roundtrips_every_value_kind() {
        let params = vec![Value::Array(vec![
            Value::Int(1),
            Value::Double(2.5),
            Value::Bool(true),
            Value::Str("hello & <world>".into()),
            Value::Struct(vec![("k".into(), Value::Int(1))]),
        ])];
        let xml = encode_method_response(&params);
        let decoded = decode_method_response(&xml).unwrap();
        assert_eq!(decoded, params);
    }

    #[test]
    fn empty_params_roundtrip() {
        let xml = encode_method_call("shutdown", &[]);
        let (name, params) = decode_method_call(&xml).unwrap();
        assert_eq!(name, "shutdown");
        assert!(params.is_empty());
    }

    #[test]
    fn fault_response_surfaces_as_rpc_method_failed() {
        let xml = encode_fault_response(-1, "no such method");
        let err = decode_method_response(&xml).unwrap_err();
        assert_eq!(err.primary(), ErrorKind::RpcMethodFailed);
    }

    #[test]
    fn nested_arrays_and_structs_roundtrip() {
        let params = vec![Value::Array(vec![Value::Array(vec![Value::Int(1), Value::Int(2)])])];
        let xml = encode_method_response(&params);
        let decoded = decode_method_response(&xml).unwrap();
        assert_eq!(decoded, params);
    }
}
