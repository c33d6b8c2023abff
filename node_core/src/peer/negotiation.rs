//! The peer-to-peer negotiation RPC surface: a small XML-RPC server, listening on its own port,
//! that handles `requestTopic`, `publisherUpdate`, `getBusInfo`, and `shutdown` calls from other
//! nodes. Every inbound connection is handled to completion and then closed - this surface does
//! not keep connections alive between calls.

use crate::error::{ErrorKind, NodeError};
use crate::socket::ManagedSocket;
use crate::xmlrpc::{codec, http, Value};
use mio::{Poll, Token};

/// Implemented by the node to answer a peer's negotiation call. One method per call the
/// surface understands; `dispatch` maps the XML-RPC method name onto the right one.
pub trait PeerRpcHandler {
    fn request_topic(&mut self, caller_id: &str, topic: &str, protocols: &[Value]) -> crate::error::Result<Vec<Value>>;
    fn publisher_update(&mut self, caller_id: &str, topic: &str, publishers: &[Value]) -> crate::error::Result<Vec<Value>>;
    fn get_bus_info(&mut self, caller_id: &str) -> crate::error::Result<Vec<Value>>;
    fn shutdown(&mut self, caller_id: &str, reason: &str) -> crate::error::Result<Vec<Value>>;
}

pub fn dispatch(handler: &mut dyn PeerRpcHandler, method_name: &str, params: &[Value]) -> crate::error::Result<Vec<Value>> {
    let caller_id = params
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| NodeError::with_detail(ErrorKind::ProtocolMalformed, "peer RPC call missing caller id"))?;

    match method_name {
        "requestTopic" => {
            let topic = params.get(1).and_then(Value::as_str).unwrap_or("");
            let protocols = params.get(2).and_then(Value::as_array).unwrap_or(&[]);
            handler.request_topic(caller_id, topic, protocols)
        }
        "publisherUpdate" => {
            let topic = params.get(1).and_then(Value::as_str).unwrap_or("");
            let publishers = params.get(2).and_then(Value::as_array).unwrap_or(&[]);
            handler.publisher_update(caller_id, topic, publishers)
        }
        "getBusInfo" => handler.get_bus_info(caller_id),
        "shutdown" => {
            let reason = params.get(1).and_then(Value::as_str).unwrap_or("");
            handler.shutdown(caller_id, reason)
        }
        other => Err(NodeError::with_detail(ErrorKind::ProtocolMalformed, format!("unknown peer RPC method `{}`", other))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    ReadingRequest,
    WritingResponse,
    Done,
}

/// One accepted connection on the negotiation listener, carried through to completion.
pub struct NegotiationConn {
    socket: ManagedSocket,
    state: ConnState,
    parser: http::HttpMessageParser,
}

impl NegotiationConn {
    pub fn new(socket: ManagedSocket) -> NegotiationConn {
        NegotiationConn {
            socket,
            state: ConnState::ReadingRequest,
            parser: http::HttpMessageParser::new(),
        }
    }

    pub fn token(&self) -> Token {
        self.socket.token()
    }

    pub fn is_done(&self) -> bool {
        self.state == ConnState::Done
    }

    /// Deregisters the underlying socket. Left for the caller to invoke once `advance` reports
    /// completion, so this type never needs to borrow `Poll` at the same moment it borrows the
    /// handler (which is usually the whole node).
    pub fn deregister(&self, poll: &Poll) -> crate::error::Result<()> {
        self.socket.deregister(poll)
    }

    /// Advances this connection, invoking `handler` once a full request has been parsed. Returns
    /// `true` once the response has been fully written and the connection can be dropped - the
    /// caller is responsible for deregistering it at that point.
    pub fn advance(&mut self, handler: &mut dyn PeerRpcHandler) -> crate::error::Result<bool> {
        if self.state == ConnState::ReadingRequest {
            self.socket.pump_inbound()?;
            let buffered = self.socket.inbound.peek(self.socket.inbound.len());

            if let Some((_request_line, body)) = self.parser.try_parse(&buffered)? {
                let consumed = self.parser.consumed_len().unwrap();
                self.socket.inbound.take(consumed);

                let (method_name, params) = codec::decode_method_call(&body)?;
                let response_params = match dispatch(handler, &method_name, &params) {
                    Ok(params) => params,
                    Err(e) => {
                        let fault = codec::encode_fault_response(1, &e.render());
                        self.socket.outbound.push_bytes(&http::build_ok_response(&fault));
                        self.state = ConnState::WritingResponse;
                        self.socket.pump_outbound()?;
                        return Ok(false);
                    }
                };

                let xml = codec::encode_method_response(&response_params);
                self.socket.outbound.push_bytes(&http::build_ok_response(&xml));
                self.state = ConnState::WritingResponse;
            }
        }

        if self.state == ConnState::WritingResponse {
            self.socket.pump_outbound()?;
            if self.socket.outbound.is_empty() {
                self.state = ConnState::Done;
                return Ok(true);
            }
        }

        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubHandler;

    impl PeerRpcHandler for StubHandler {
        fn request_topic(&mut self, _caller_id: &str, _topic: &str, _protocols: &[Value]) -> crate::error::Result<Vec<Value>> {
            Ok(vec![Value::Int(1), Value::Str("ok".into()), Value::Array(vec![])])
        }

        fn publisher_update(&mut self, _caller_id: &str, _topic: &str, _publishers: &[Value]) -> crate::error::Result<Vec<Value>> {
            Ok(vec![Value::Int(1), Value::Str("ok".into()), Value::Int(0)])
        }

        fn get_bus_info(&mut self, _caller_id: &str) -> crate::error::Result<Vec<Value>> {
            Ok(vec![Value::Int(1), Value::Str("ok".into()), Value::Array(vec![])])
        }

        fn shutdown(&mut self, _caller_id: &str, _reason: &str) -> crate::error::Result<Vec<Value>> {
            Ok(vec![Value::Int(1), Value::Str("ok".into()), Value::Int(0)])
        }
    }

    #[test]
    fn dispatch_routes_every_known_method() {
        let mut handler = StubHandler;
        let caller = vec![Value::Str("/talker".into())];

        assert!(dispatch(&mut handler, "requestTopic", &[caller[0].clone(), Value::Str("/t".into()), Value::Array(vec![])]).is_ok());
        assert!(dispatch(&mut handler, "getBusInfo", &caller).is_ok());
        assert!(dispatch(&mut handler, "shutdown", &[caller[0].clone(), Value::Str("bye".into())]).is_ok());
    }

    #[test]
    fn unknown_method_is_protocol_malformed() {
        let mut handler = StubHandler;
        let err = dispatch(&mut handler, "frobnicate", &[Value::Str("/x".into())]).unwrap_err();
        assert_eq!(err.primary(), ErrorKind::ProtocolMalformed);
    }

    #[test]
    fn missing_caller_id_is_rejected() {
        let mut handler = StubHandler;
        let err = dispatch(&mut handler, "getBusInfo", &[]).unwrap_err();
        assert_eq!(err.primary(), ErrorKind::ProtocolMalformed);
    }
}
