//! A single queued or in-flight call against the master (or, for the peer-RPC equivalents, a
//! directly addressed peer). One [`RosApiCall`] carries everything a [`crate::master::client::MasterCallClient`]
//! needs to dial out, speak XML-RPC, and hand the decoded result back to whichever registry
//! slot asked for it.

use crate::xmlrpc::Value;

/// The closed set of XML-RPC methods this crate ever issues, covering both the master-facing
/// registration surface and the peer-to-peer negotiation surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodCode {
    RegisterPublisher,
    UnregisterPublisher,
    RegisterSubscriber,
    UnregisterSubscriber,
    RegisterService,
    UnregisterService,
    LookupService,
    RequestTopic,
    PublisherUpdate,
    GetBusInfo,
    Shutdown,
}

impl MethodCode {
    pub fn method_name(self) -> &'static str {
        match self {
            MethodCode::RegisterPublisher => "registerPublisher",
            MethodCode::UnregisterPublisher => "unregisterPublisher",
            MethodCode::RegisterSubscriber => "registerSubscriber",
            MethodCode::UnregisterSubscriber => "unregisterSubscriber",
            MethodCode::RegisterService => "registerService",
            MethodCode::UnregisterService => "unregisterService",
            MethodCode::LookupService => "lookupService",
            MethodCode::RequestTopic => "requestTopic",
            MethodCode::PublisherUpdate => "publisherUpdate",
            MethodCode::GetBusInfo => "getBusInfo",
            MethodCode::Shutdown => "shutdown",
        }
    }

    /// True for the peer-negotiation surface (dialed directly at a peer's negotiation port)
    /// rather than the master.
    pub fn is_peer_rpc(self) -> bool {
        matches!(
            self,
            MethodCode::RequestTopic | MethodCode::PublisherUpdate | MethodCode::GetBusInfo | MethodCode::Shutdown
        )
    }
}

/// A queued call plus everything needed to complete it and route the result back. The
/// "fetch-result / user-result / free-result" triple of callback pointers collapses here to a
/// single `on_result` closure: ownership and `Drop` already give Rust the destructor the C-style
/// three-callback split exists to simulate, so a `FnOnce` is the idiomatic equivalent of all
/// three.
pub struct RosApiCall {
    pub id: u64,
    pub method: MethodCode,
    pub params: Vec<Value>,
    pub host: String,
    pub port: u16,
    pub provider_index: usize,
    pub on_result: Box<dyn FnOnce(crate::error::Result<Vec<Value>>, usize)>,
}

impl RosApiCall {
    pub fn new(
        id: u64,
        method: MethodCode,
        params: Vec<Value>,
        host: impl Into<String>,
        port: u16,
        provider_index: usize,
        on_result: impl FnOnce(crate::error::Result<Vec<Value>>, usize) + 'static,
    ) -> RosApiCall {
        RosApiCall {
            id,
            method,
            params,
            host: host.into(),
            port,
            provider_index,
            on_result: Box::new(on_result),
        }
    }
}
