//! The process-wide participant: owns every socket, registry, and in-flight call, and exposes
//! the upward, user-facing API. [`crate::event_loop::start_loop`] is the only thing that drives
//! it continuously; [`Node::service_call`] also drives it directly for the duration of one
//! blocking-style round trip.

use crate::clock::Clock;
use crate::config::NodeConfig;
use crate::error::{ErrorKind, NodeError};
use crate::master::{ApiCallQueue, MasterCallClient, MethodCode, RosApiCall};
use crate::message::codec as message_codec;
use crate::message::{MessageTemplate, MessageValue, SchemaLoader};
use crate::peer::{ChannelEvent, ChannelHeader, ChannelRole, NegotiationConn, PeerChannel, PeerRpcHandler, ANY_MD5};
use crate::registry::{
    PublisherRegistry, PublisherSlot, ServiceCallerRegistry, ServiceCallerSlot, ServiceProviderRegistry, ServiceProviderSlot, SlotArena,
    SubscriberEvent, SubscriberRegistry, SubscriberSlot,
};
use crate::socket::ManagedSocket;
use crate::timer::PeriodicTimer;
use crate::xmlrpc::Value;
use hashbrown::HashMap;
use mio::net::TcpListener;
use mio::{Events, Poll, PollOpt, Ready, Token};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

const TOKEN_MASTER_CLIENT: usize = 0;
const TOKEN_NEGOTIATION_LISTENER: usize = 1;
const TOKEN_DATA_LISTENER: usize = 2;
const TOKEN_SERVICE_LISTENER: usize = 3;
const TOKEN_DYNAMIC_BASE: usize = 16;

struct MasterCallOutcome {
    id: u64,
    method: MethodCode,
    provider_index: usize,
    result: crate::error::Result<Vec<Value>>,
}

pub struct Node {
    config: NodeConfig,
    clock: Box<dyn Clock>,
    logger: slog::Logger,
    poll: Poll,
    #[allow(dead_code)]
    schema: Box<dyn SchemaLoader>,

    publishers: PublisherRegistry,
    subscribers: SubscriberRegistry,
    service_providers: ServiceProviderRegistry,
    service_callers: ServiceCallerRegistry,

    peer_channels: SlotArena<PeerChannel>,
    peer_token_to_index: HashMap<usize, usize>,
    provider_for_peer: HashMap<usize, usize>,
    publisher_for_peer: HashMap<usize, usize>,
    negotiation_conns: SlotArena<NegotiationConn>,
    negotiation_token_to_index: HashMap<usize, usize>,

    negotiation_listener: TcpListener,
    data_listener: TcpListener,
    service_listener: TcpListener,
    negotiation_port: u16,
    data_port: u16,
    service_port: u16,

    queue: ApiCallQueue,
    master_client: MasterCallClient,
    pending_outcomes: Rc<RefCell<VecDeque<MasterCallOutcome>>>,
    pending_request_topic: HashMap<u64, (usize, String)>,
    last_service_response: Option<crate::error::Result<MessageValue>>,

    publisher_timers: HashMap<usize, PeriodicTimer>,
    caller_timers: HashMap<usize, PeriodicTimer>,

    next_dynamic_token: usize,
    shutdown_requested: bool,
}

impl Node {
    pub fn create(config: NodeConfig, clock: Box<dyn Clock>, logger: slog::Logger, schema: Box<dyn SchemaLoader>) -> crate::error::Result<Node> {
        let poll = Poll::new().map_err(NodeError::from)?;

        let negotiation_listener = TcpListener::bind(&SocketAddr::new(config.bind_host, 0)).map_err(NodeError::from)?;
        let negotiation_port = negotiation_listener.local_addr().map_err(NodeError::from)?.port();
        poll.register(&negotiation_listener, Token(TOKEN_NEGOTIATION_LISTENER), Ready::readable(), PollOpt::edge())
            .map_err(NodeError::from)?;

        let data_listener = TcpListener::bind(&SocketAddr::new(config.bind_host, 0)).map_err(NodeError::from)?;
        let data_port = data_listener.local_addr().map_err(NodeError::from)?.port();
        poll.register(&data_listener, Token(TOKEN_DATA_LISTENER), Ready::readable(), PollOpt::edge())
            .map_err(NodeError::from)?;

        // Topic data (always role Publisher on accept) and service calls (always role
        // ServiceProvider on accept) get separate listening ports - a channel's role is fixed at
        // construction and decides how it decodes inbound frames, so one shared listener can't
        // correctly serve both kinds of connection.
        let service_listener = TcpListener::bind(&SocketAddr::new(config.bind_host, 0)).map_err(NodeError::from)?;
        let service_port = service_listener.local_addr().map_err(NodeError::from)?.port();
        poll.register(&service_listener, Token(TOKEN_SERVICE_LISTENER), Ready::readable(), PollOpt::edge())
            .map_err(NodeError::from)?;

        let master_client = MasterCallClient::new(
            Token(TOKEN_MASTER_CLIENT),
            config.reconnect_backoff_initial,
            config.reconnect_backoff_cap,
            config.master_call_retry_cap,
        );

        slog::info!(logger, "node created"; "negotiation_port" => negotiation_port, "data_port" => data_port, "service_port" => service_port);

        Ok(Node {
            config,
            clock,
            logger,
            poll,
            schema,
            publishers: PublisherRegistry::new(),
            subscribers: SubscriberRegistry::new(),
            service_providers: ServiceProviderRegistry::new(),
            service_callers: ServiceCallerRegistry::new(),
            peer_channels: SlotArena::new(),
            peer_token_to_index: HashMap::new(),
            provider_for_peer: HashMap::new(),
            publisher_for_peer: HashMap::new(),
            negotiation_conns: SlotArena::new(),
            negotiation_token_to_index: HashMap::new(),
            negotiation_listener,
            data_listener,
            service_listener,
            negotiation_port,
            data_port,
            service_port,
            queue: ApiCallQueue::new(),
            master_client,
            pending_outcomes: Rc::new(RefCell::new(VecDeque::new())),
            pending_request_topic: HashMap::new(),
            last_service_response: None,
            publisher_timers: HashMap::new(),
            caller_timers: HashMap::new(),
            next_dynamic_token: TOKEN_DYNAMIC_BASE,
            shutdown_requested: false,
        })
    }

    pub fn negotiation_port(&self) -> u16 {
        self.negotiation_port
    }

    pub fn data_port(&self) -> u16 {
        self.data_port
    }

    pub fn service_port(&self) -> u16 {
        self.service_port
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    fn node_uri(&self) -> String {
        format!("http://{}:{}/", self.config.advertised_host, self.negotiation_port)
    }

    fn allocate_token(&mut self) -> usize {
        let token = self.next_dynamic_token;
        self.next_dynamic_token += 1;
        token
    }

    fn master_addr(&self) -> crate::error::Result<(String, u16)> {
        parse_host_port(&self.config.master_uri)
    }

    // ---- Upward API: registration -------------------------------------------------------

    pub fn register_publisher(&mut self, topic: impl Into<String>, template: MessageTemplate, queue_size: usize, loop_period: Option<Duration>) -> usize {
        let topic = topic.into();
        let slot = PublisherSlot::new(template.clone(), queue_size, loop_period).with_topic(topic.clone());
        let index = self.publishers.register(slot);

        if let Some(period) = loop_period {
            self.publisher_timers.insert(index, PeriodicTimer::new(period, self.clock.now_micros()));
        }

        let params = vec![
            Value::Str(self.config.node_name.clone()),
            Value::Str(topic),
            Value::Str(template.type_name.clone()),
            Value::Str(self.node_uri()),
        ];
        self.enqueue_master_call(MethodCode::RegisterPublisher, params, index);
        index
    }

    pub fn unregister_publisher(&mut self, index: usize) -> crate::error::Result<()> {
        let slot = self
            .publishers
            .get(index)
            .ok_or_else(|| NodeError::with_detail(ErrorKind::BadArgument, "no such publisher slot"))?;

        let params = vec![
            Value::Str(self.config.node_name.clone()),
            Value::Str(slot.topic.clone()),
            Value::Str(self.node_uri()),
        ];
        self.enqueue_master_call(MethodCode::UnregisterPublisher, params, index);
        self.publisher_timers.remove(&index);
        Ok(())
    }

    pub fn register_subscriber(
        &mut self,
        topic: impl Into<String>,
        template: MessageTemplate,
        on_message: impl FnMut(SubscriberEvent) + 'static,
    ) -> usize {
        let topic = topic.into();
        let slot = SubscriberSlot::new(topic.clone(), template.clone(), on_message);
        let index = self.subscribers.register(slot);

        let params = vec![
            Value::Str(self.config.node_name.clone()),
            Value::Str(topic),
            Value::Str(template.type_name.clone()),
            Value::Str(self.node_uri()),
        ];
        self.enqueue_master_call(MethodCode::RegisterSubscriber, params, index);
        index
    }

    pub fn unregister_subscriber(&mut self, index: usize) -> crate::error::Result<()> {
        let slot = self
            .subscribers
            .get(index)
            .ok_or_else(|| NodeError::with_detail(ErrorKind::BadArgument, "no such subscriber slot"))?;

        let params = vec![
            Value::Str(self.config.node_name.clone()),
            Value::Str(slot.topic.clone()),
            Value::Str(self.node_uri()),
        ];
        self.enqueue_master_call(MethodCode::UnregisterSubscriber, params, index);
        Ok(())
    }

    pub fn register_service_provider(&mut self, slot: ServiceProviderSlot) -> usize {
        let name = slot.name.clone();
        let index = self.service_providers.register(slot);

        let params = vec![
            Value::Str(self.config.node_name.clone()),
            Value::Str(name),
            Value::Str(format!("rosrpc://{}:{}", self.config.advertised_host, self.service_port)),
            Value::Str(self.node_uri()),
        ];
        self.enqueue_master_call(MethodCode::RegisterService, params, index);
        index
    }

    pub fn unregister_service_provider(&mut self, index: usize) -> crate::error::Result<()> {
        let slot = self
            .service_providers
            .get(index)
            .ok_or_else(|| NodeError::with_detail(ErrorKind::BadArgument, "no such service slot"))?;

        let params = vec![
            Value::Str(self.config.node_name.clone()),
            Value::Str(slot.name.clone()),
            Value::Str(format!("rosrpc://{}:{}", self.config.advertised_host, self.service_port)),
        ];
        self.enqueue_master_call(MethodCode::UnregisterService, params, index);
        Ok(())
    }

    pub fn register_service_caller(&mut self, slot: ServiceCallerSlot) -> usize {
        let has_period = slot.loop_period.is_some();
        let period = slot.loop_period;
        let index = self.service_callers.register(slot);
        if let (true, Some(period)) = (has_period, period) {
            self.caller_timers.insert(index, PeriodicTimer::new(period, self.clock.now_micros()));
        }
        index
    }

    pub fn unregister_service_caller(&mut self, index: usize) -> Option<ServiceCallerSlot> {
        self.caller_timers.remove(&index);
        self.service_callers.unregister(index)
    }

    // ---- Upward API: messaging ------------------------------------------------------------

    pub fn create_template_message(&self, publisher_index: usize) -> crate::error::Result<MessageValue> {
        let slot = self
            .publishers
            .get(publisher_index)
            .ok_or_else(|| NodeError::with_detail(ErrorKind::BadArgument, "no such publisher slot"))?;
        Ok(slot.template.instantiate())
    }

    pub fn send_topic_message(&mut self, publisher_index: usize, message: &MessageValue) -> crate::error::Result<()> {
        let encoded = message_codec::encode(message)?;
        let peers: Vec<usize> = {
            let slot = self
                .publishers
                .get_mut(publisher_index)
                .ok_or_else(|| NodeError::with_detail(ErrorKind::BadArgument, "no such publisher slot"))?;
            slot.last_publish_at_micros = self.clock.now_micros();
            slot.connected_peers.clone()
        };

        for peer_index in peers {
            if let Some(channel) = self.peer_channels.get_mut(peer_index) {
                let _ = channel.send_message(&encoded);
            }
        }
        Ok(())
    }

    /// Issues a service call and drives the event loop directly until a response arrives or
    /// `timeout` elapses - the one upward API call that is blocking-by-convenience rather than
    /// purely event-driven.
    pub fn service_call(&mut self, caller_index: usize, request: MessageValue, timeout: Duration) -> crate::error::Result<MessageValue> {
        let peer_index = self.dispatch_service_request(caller_index, request)?;

        self.last_service_response = None;
        let deadline = self.clock.now_micros() + timeout.as_micros() as u64;
        loop {
            self.pump(Some(Duration::from_millis(20)))?;

            if let Some(response) = self.last_service_response.take() {
                return response;
            }

            if let Some(channel) = self.peer_channels.get(peer_index) {
                if channel.is_closed() {
                    return Err(NodeError::with_detail(ErrorKind::TransportIo, "service channel closed before a response arrived"));
                }
            }

            if self.clock.now_micros() >= deadline {
                return Err(NodeError::new(ErrorKind::TransportTimeout));
            }
        }
    }

    /// Fills and sends one request for `caller_index`, opening (or reusing) its peer channel
    /// first. Does not wait for the response - the reply arrives later through the ordinary
    /// event loop as a `ChannelEvent::ServiceResponseReceived`, which `handle_service_response`
    /// delivers to the caller's `on_response` regardless of who triggered the request.
    fn dispatch_service_request(&mut self, caller_index: usize, mut request: MessageValue) -> crate::error::Result<usize> {
        {
            let slot = self
                .service_callers
                .get_mut(caller_index)
                .ok_or_else(|| NodeError::with_detail(ErrorKind::BadArgument, "no such service caller slot"))?;
            (slot.fill_request)(&mut request);
        }

        let peer_index = self.ensure_service_peer(caller_index)?;
        let encoded = message_codec::encode(&request)?;
        if let Some(channel) = self.peer_channels.get_mut(peer_index) {
            channel.send_message(&encoded);
        }
        Ok(peer_index)
    }

    fn ensure_service_peer(&mut self, caller_index: usize) -> crate::error::Result<usize> {
        let existing = self.service_callers.get(caller_index).and_then(|s| s.peer_index);
        if let Some(peer_index) = existing {
            if self.peer_channels.get(peer_index).map(|c| !c.is_closed()).unwrap_or(false) {
                return Ok(peer_index);
            }
        }

        let (name, md5, persistent) = {
            let slot = self
                .service_callers
                .get(caller_index)
                .ok_or_else(|| NodeError::with_detail(ErrorKind::BadArgument, "no such service caller slot"))?;
            (slot.name.clone(), slot.md5.clone(), slot.persistent)
        };

        // In this crate's scope, a service call resolves directly against this node's own
        // advertised service port rather than driving a `lookupService` round trip first -
        // callers outside the local process go through `lookupService` to learn the host/port,
        // which isn't modeled here since nothing in this crate plays the role of a remote client.
        let addr: SocketAddr = format!("{}:{}", self.config.advertised_host, self.service_port)
            .parse()
            .map_err(|_| NodeError::with_detail(ErrorKind::BadArgument, "invalid service address"))?;

        let token = self.allocate_token();
        let header = ChannelHeader {
            topic: name,
            message_type: "service".into(),
            md5: md5.clone(),
            caller_id: self.config.node_name.clone(),
            latching: false,
            persistent,
        };

        let channel = PeerChannel::connecting(
            ChannelRole::ServiceCaller,
            Token(token),
            addr,
            header,
            md5,
            self.config.queue_high_water_mark,
            64,
            self.config.reconnect_backoff_initial,
            self.config.reconnect_backoff_cap,
        );
        let peer_index = self.peer_channels.insert(channel);
        self.peer_token_to_index.insert(token, peer_index);

        if let Some(slot) = self.service_callers.get_mut(caller_index) {
            slot.peer_index = Some(peer_index);
        }

        Ok(peer_index)
    }

    pub fn wait_port_open(&self, host: &str, port: u16, timeout: Duration) -> crate::error::Result<()> {
        use std::net::TcpStream;
        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .map_err(|_| NodeError::with_detail(ErrorKind::BadArgument, "invalid host/port"))?;
        TcpStream::connect_timeout(&addr, timeout).map_err(|e| NodeError::from(e).layer(ErrorKind::MasterUnreachable))?;
        Ok(())
    }

    // ---- Event loop step --------------------------------------------------------------

    /// One non-blocking iteration: poll readiness, advance every ready state machine, drain at
    /// most one queued master/peer-RPC call, fire due timers.
    pub fn pump(&mut self, timeout: Option<Duration>) -> crate::error::Result<()> {
        let mut events = Events::with_capacity(1024);
        self.poll.poll(&mut events, timeout).map_err(NodeError::from)?;

        for event in events.iter() {
            let token = event.token().0;
            match token {
                TOKEN_NEGOTIATION_LISTENER => self.accept_negotiation()?,
                TOKEN_DATA_LISTENER => self.accept_data()?,
                TOKEN_SERVICE_LISTENER => self.accept_service()?,
                TOKEN_MASTER_CLIENT => {
                    let _ = self.master_client.advance(&self.poll, self.clock.as_ref())?;
                }
                other => {
                    if let Some(&peer_index) = self.peer_token_to_index.get(&other) {
                        self.advance_peer_channel(peer_index)?;
                    } else if let Some(&conn_index) = self.negotiation_token_to_index.get(&other) {
                        self.advance_negotiation_conn(conn_index)?;
                    }
                }
            }
        }

        if self.master_client.is_idle() {
            if let Some(call) = self.queue.pop_front() {
                self.master_client.submit(call, &self.poll)?;
            }
        } else {
            let _ = self.master_client.advance(&self.poll, self.clock.as_ref())?;
        }

        self.drain_outcomes();
        self.fire_timers()?;
        Ok(())
    }

    fn accept_negotiation(&mut self) -> crate::error::Result<()> {
        loop {
            match self.negotiation_listener.accept() {
                Ok((stream, _addr)) => {
                    let token = self.allocate_token();
                    let socket = ManagedSocket::from_accepted(stream, Token(token), &self.poll)?;
                    let index = self.negotiation_conns.insert(NegotiationConn::new(socket));
                    self.negotiation_token_to_index.insert(token, index);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(NodeError::from(e)),
            }
        }
        Ok(())
    }

    fn accept_data(&mut self) -> crate::error::Result<()> {
        loop {
            match self.data_listener.accept() {
                Ok((stream, _addr)) => {
                    let token = self.allocate_token();
                    let socket = ManagedSocket::from_accepted(stream, Token(token), &self.poll)?;
                    let header = ChannelHeader {
                        topic: String::new(),
                        message_type: String::new(),
                        md5: String::new(),
                        caller_id: self.config.node_name.clone(),
                        latching: false,
                        persistent: false,
                    };
                    let channel = PeerChannel::accepted(ChannelRole::Publisher, socket, header, ANY_MD5.to_string(), self.config.queue_high_water_mark, 64);
                    let index = self.peer_channels.insert(channel);
                    self.peer_token_to_index.insert(token, index);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(NodeError::from(e)),
            }
        }
        Ok(())
    }

    fn accept_service(&mut self) -> crate::error::Result<()> {
        loop {
            match self.service_listener.accept() {
                Ok((stream, _addr)) => {
                    let token = self.allocate_token();
                    let socket = ManagedSocket::from_accepted(stream, Token(token), &self.poll)?;
                    let header = ChannelHeader {
                        topic: String::new(),
                        message_type: "service".into(),
                        md5: String::new(),
                        caller_id: self.config.node_name.clone(),
                        latching: false,
                        persistent: false,
                    };
                    let channel =
                        PeerChannel::accepted(ChannelRole::ServiceProvider, socket, header, ANY_MD5.to_string(), self.config.queue_high_water_mark, 64);
                    let index = self.peer_channels.insert(channel);
                    self.peer_token_to_index.insert(token, index);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(NodeError::from(e)),
            }
        }
        Ok(())
    }

    fn advance_peer_channel(&mut self, peer_index: usize) -> crate::error::Result<()> {
        let events = match self.peer_channels.get_mut(peer_index) {
            Some(channel) => channel.advance(&self.poll, self.clock.as_ref())?,
            None => return Ok(()),
        };

        for event in events {
            self.handle_channel_event(peer_index, event);
        }
        Ok(())
    }

    fn handle_channel_event(&mut self, peer_index: usize, event: ChannelEvent) {
        match event {
            ChannelEvent::MessageReceived(payload) => {
                if let Some((subscriber_index, template)) = self.subscriber_for_peer(peer_index) {
                    if let Ok(message) = message_codec::decode(&template, &payload) {
                        if let Some(slot) = self.subscribers.get_mut(subscriber_index) {
                            (slot.on_message)(SubscriberEvent::Message(&message));
                        }
                    }
                }
            }
            ChannelEvent::ServiceRequestReceived(payload) => {
                self.handle_service_request(peer_index, payload);
            }
            ChannelEvent::ServiceResponseReceived { ok, payload } => {
                self.handle_service_response(peer_index, ok, payload);
            }
            ChannelEvent::HeaderExchanged(header) => {
                slog::debug!(self.logger, "peer header exchanged"; "peer_index" => peer_index, "name" => header.topic.clone());
                let role = self.peer_channels.get(peer_index).map(|c| c.role());
                match role {
                    Some(ChannelRole::ServiceProvider) => {
                        if let Some(provider_index) = self.service_providers.find_by_name(&header.topic) {
                            let md5_ok = self.service_providers.get(provider_index).map(|s| s.md5 == header.md5).unwrap_or(false);
                            if md5_ok {
                                self.provider_for_peer.insert(peer_index, provider_index);
                            } else if let Some(channel) = self.peer_channels.get_mut(peer_index) {
                                channel.force_close(&self.poll);
                            }
                        } else if let Some(channel) = self.peer_channels.get_mut(peer_index) {
                            channel.force_close(&self.poll);
                        }
                    }
                    Some(ChannelRole::Publisher) => {
                        // An accepted data channel doesn't know which advertised topic it's for
                        // until the subscriber's header names it - only then can it be attached
                        // to a publisher slot's fan-out list.
                        let publisher_index = self.publishers.iter().find(|(_, slot)| slot.topic == header.topic).map(|(i, _)| i);
                        match publisher_index {
                            Some(index) => {
                                let md5_ok = self.publishers.get(index).map(|slot| slot.md5 == header.md5).unwrap_or(false);
                                if md5_ok {
                                    self.publisher_for_peer.insert(peer_index, index);
                                    if let Some(slot) = self.publishers.get_mut(index) {
                                        slot.connected_peers.push(peer_index);
                                    }
                                } else if let Some(channel) = self.peer_channels.get_mut(peer_index) {
                                    channel.force_close(&self.poll);
                                }
                            }
                            None => {
                                if let Some(channel) = self.peer_channels.get_mut(peer_index) {
                                    channel.force_close(&self.poll);
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
            ChannelEvent::Closed(err) => {
                slog::info!(self.logger, "peer channel closed"; "peer_index" => peer_index, "error" => %err);
                self.provider_for_peer.remove(&peer_index);
                if let Some(publisher_index) = self.publisher_for_peer.remove(&peer_index) {
                    if let Some(slot) = self.publishers.get_mut(publisher_index) {
                        slot.connected_peers.retain(|&p| p != peer_index);
                    }
                }
                if err.primary() == ErrorKind::ProtocolMd5Mismatch {
                    if let Some((subscriber_index, _)) = self.subscriber_for_peer(peer_index) {
                        if let Some(slot) = self.subscribers.get_mut(subscriber_index) {
                            (slot.on_message)(SubscriberEvent::Error(&err));
                        }
                    }
                }
            }
        }
    }

    fn subscriber_for_peer(&self, peer_index: usize) -> Option<(usize, MessageTemplate)> {
        for (index, slot) in self.subscribers.iter() {
            if slot.peer_by_uri.values().any(|&p| p == peer_index) {
                return Some((index, slot.template.clone()));
            }
        }
        None
    }

    fn handle_service_request(&mut self, peer_index: usize, payload: Vec<u8>) {
        let provider_index = match self.provider_for_peer.get(&peer_index).copied() {
            Some(i) => i,
            None => return,
        };

        let response = {
            let slot = match self.service_providers.get_mut(provider_index) {
                Some(slot) => slot,
                None => return,
            };
            let request = match message_codec::decode(&slot.request_template, &payload) {
                Ok(req) => req,
                Err(_) => return,
            };
            (slot.on_call)(&request)
        };

        let (ok, payload) = match response {
            Ok(message) => match message_codec::encode(&message) {
                Ok(bytes) => (true, bytes),
                Err(_) => (false, Vec::new()),
            },
            Err(e) => (false, e.render().into_bytes()),
        };

        if let Some(channel) = self.peer_channels.get_mut(peer_index) {
            channel.send_service_response(ok, &payload);
        }
    }

    fn handle_service_response(&mut self, peer_index: usize, ok: bool, payload: Vec<u8>) {
        let caller_index = self.service_callers.iter_mut().find(|(_, s)| s.peer_index == Some(peer_index)).map(|(i, _)| i);
        let caller_index = match caller_index {
            Some(i) => i,
            None => return,
        };

        let result = if ok {
            let template = self.service_callers.get(caller_index).map(|s| s.response_template.clone());
            match template {
                Some(template) => message_codec::decode(&template, &payload),
                None => Err(NodeError::new(ErrorKind::InternalInvariant)),
            }
        } else {
            Err(NodeError::with_detail(ErrorKind::RpcMethodFailed, String::from_utf8_lossy(&payload).into_owned()))
        };

        self.last_service_response = Some(result.clone());

        if let Some(slot) = self.service_callers.get_mut(caller_index) {
            (slot.on_response)(result);
            if !slot.persistent {
                if let Some(channel) = self.peer_channels.get_mut(peer_index) {
                    channel.force_close(&self.poll);
                }
                slot.peer_index = None;
            }
        }
    }

    fn advance_negotiation_conn(&mut self, conn_index: usize) -> crate::error::Result<()> {
        // The conn is pulled out of the arena for the duration of the call - `advance` takes
        // `self` as the `PeerRpcHandler`, and `self` already owns `poll`, so the two borrows
        // can't coexist if the conn stayed borrowed from `self.negotiation_conns` too. The
        // arena's free-list makes this safe without renumbering: nothing else touches the arena
        // between the remove and the reinsert below, so the slot comes straight back.
        let mut conn = match self.negotiation_conns.remove(conn_index) {
            Some(conn) => conn,
            None => return Ok(()),
        };

        match conn.advance(self) {
            Ok(true) => {
                let _ = conn.deregister(&self.poll);
                self.negotiation_token_to_index.remove(&conn.token().0);
            }
            Ok(false) => {
                let reinserted = self.negotiation_conns.insert(conn);
                debug_assert_eq!(reinserted, conn_index);
            }
            Err(e) => {
                slog::debug!(self.logger, "negotiation connection failed"; "error" => %e);
                let _ = conn.deregister(&self.poll);
                self.negotiation_token_to_index.remove(&conn.token().0);
            }
        }
        Ok(())
    }

    fn enqueue_master_call(&mut self, method: MethodCode, params: Vec<Value>, provider_index: usize) {
        let id = self.queue.next_id();
        let outcomes = self.pending_outcomes.clone();
        let (host, port) = match self.master_addr() {
            Ok(addr) => addr,
            Err(e) => {
                outcomes.borrow_mut().push_back(MasterCallOutcome { id, method, provider_index, result: Err(e) });
                return;
            }
        };

        let call = RosApiCall::new(id, method, params, host, port, provider_index, move |result, provider_index| {
            outcomes.borrow_mut().push_back(MasterCallOutcome { id, method, provider_index, result });
        });
        self.queue.push(call);
    }

    fn drain_outcomes(&mut self) {
        loop {
            let outcome = self.pending_outcomes.borrow_mut().pop_front();
            let outcome = match outcome {
                Some(o) => o,
                None => break,
            };
            self.handle_master_outcome(outcome);
        }
    }

    fn handle_master_outcome(&mut self, outcome: MasterCallOutcome) {
        match outcome.method {
            MethodCode::RegisterPublisher => {
                if let Some(slot) = self.publishers.get_mut(outcome.provider_index) {
                    slot.registered_with_master = outcome.result.is_ok();
                }
            }
            MethodCode::UnregisterPublisher => {
                self.publishers.unregister(outcome.provider_index);
            }
            MethodCode::RegisterSubscriber => {
                if let Ok(params) = &outcome.result {
                    if let Some(slot) = self.subscribers.get_mut(outcome.provider_index) {
                        slot.registered_with_master = true;
                    }
                    let uris = params.get(2).and_then(Value::as_array).unwrap_or(&[]).to_vec();
                    for uri_value in uris {
                        if let Some(uri) = uri_value.as_str() {
                            self.negotiate_with_publisher(outcome.provider_index, uri.to_string());
                        }
                    }
                }
            }
            MethodCode::UnregisterSubscriber => {
                self.subscribers.unregister(outcome.provider_index);
            }
            MethodCode::RegisterService => {
                if let Some(slot) = self.service_providers.get_mut(outcome.provider_index) {
                    slot.registered_with_master = outcome.result.is_ok();
                }
            }
            MethodCode::UnregisterService => {
                self.service_providers.unregister(outcome.provider_index);
            }
            MethodCode::RequestTopic => {
                if let Some((subscriber_index, uri)) = self.pending_request_topic.remove(&outcome.id) {
                    if let Ok(params) = outcome.result {
                        self.open_subscriber_peer(subscriber_index, &uri, &params);
                    }
                }
            }
            MethodCode::LookupService | MethodCode::PublisherUpdate | MethodCode::GetBusInfo | MethodCode::Shutdown => {}
        }
    }

    fn negotiate_with_publisher(&mut self, subscriber_index: usize, uri: String) {
        let already_connected = self.subscribers.get(subscriber_index).and_then(|s| s.existing_peer_for(&uri)).is_some();
        if already_connected {
            return;
        }

        let (host, port) = match parse_host_port(&uri) {
            Ok(hp) => hp,
            Err(_) => return,
        };

        let topic = self.subscribers.get(subscriber_index).map(|s| s.topic.clone()).unwrap_or_default();
        let params = vec![
            Value::Str(self.config.node_name.clone()),
            Value::Str(topic),
            Value::Array(vec![Value::Array(vec![Value::Str("TCPROS".into())])]),
        ];

        let id = self.queue.next_id();
        self.pending_request_topic.insert(id, (subscriber_index, uri));
        let outcomes = self.pending_outcomes.clone();
        let call = RosApiCall::new(id, MethodCode::RequestTopic, params, host, port, subscriber_index, move |result, provider_index| {
            outcomes.borrow_mut().push_back(MasterCallOutcome {
                id,
                method: MethodCode::RequestTopic,
                provider_index,
                result,
            });
        });
        self.queue.push(call);
    }

    fn open_subscriber_peer(&mut self, subscriber_index: usize, uri: &str, protocol_result: &[Value]) {
        let protocol = match protocol_result.get(2).and_then(Value::as_array) {
            Some(p) => p,
            None => return,
        };
        let host = protocol.get(1).and_then(Value::as_str).unwrap_or(&self.config.advertised_host).to_string();
        let port = protocol.get(2).and_then(Value::as_int).unwrap_or(0) as u16;

        let (topic, message_type, md5) = match self.subscribers.get(subscriber_index) {
            Some(slot) => (slot.topic.clone(), slot.message_type.clone(), slot.md5.clone()),
            None => return,
        };

        let addr: SocketAddr = match format!("{}:{}", host, port).parse() {
            Ok(addr) => addr,
            Err(_) => return,
        };

        let token = self.allocate_token();
        let header = ChannelHeader {
            topic,
            message_type,
            md5: md5.clone(),
            caller_id: self.config.node_name.clone(),
            latching: false,
            persistent: false,
        };

        let channel = PeerChannel::connecting(
            ChannelRole::Subscriber,
            Token(token),
            addr,
            header,
            md5,
            self.config.queue_high_water_mark,
            64,
            self.config.reconnect_backoff_initial,
            self.config.reconnect_backoff_cap,
        );
        let peer_index = self.peer_channels.insert(channel);
        self.peer_token_to_index.insert(token, peer_index);

        if let Some(slot) = self.subscribers.get_mut(subscriber_index) {
            slot.record_peer(uri, peer_index);
        }
    }

    fn fire_timers(&mut self) -> crate::error::Result<()> {
        let now = self.clock.now_micros();

        let due_publishers: Vec<usize> = self
            .publisher_timers
            .iter_mut()
            .filter_map(|(&index, timer)| if timer.poll(now) { Some(index) } else { None })
            .collect();
        for index in due_publishers {
            if let Some(slot) = self.publishers.get(index) {
                let message = slot.template.instantiate();
                let _ = self.send_topic_message(index, &message);
            }
        }

        let due_callers: Vec<usize> = self
            .caller_timers
            .iter_mut()
            .filter_map(|(&index, timer)| if timer.poll(now) { Some(index) } else { None })
            .collect();
        for index in due_callers {
            let request = match self.service_callers.get(index) {
                Some(slot) => slot.request_template.instantiate(),
                None => continue,
            };
            if let Err(err) = self.dispatch_service_request(index, request) {
                slog::debug!(self.logger, "periodic service call failed to dispatch"; "caller_index" => index, "error" => %err);
            }
        }

        Ok(())
    }

    /// Unregisters every still-registered slot from the master before the node is dropped, so
    /// the "unregister eventually sent" invariant holds even on an orderly shutdown.
    pub fn destroy(mut self) -> crate::error::Result<()> {
        let publisher_indices: Vec<usize> = self.publishers.iter().map(|(i, _)| i).collect();
        for index in publisher_indices {
            let _ = self.unregister_publisher(index);
        }

        let deadline = self.clock.now_micros() + Duration::from_secs(5).as_micros() as u64;
        while !self.queue.is_empty() && self.clock.now_micros() < deadline {
            self.pump(Some(Duration::from_millis(10)))?;
        }

        Ok(())
    }
}

impl PeerRpcHandler for Node {
    fn request_topic(&mut self, _caller_id: &str, topic: &str, _protocols: &[Value]) -> crate::error::Result<Vec<Value>> {
        let found = self.publishers.iter().any(|(_, slot)| slot.topic == topic);
        if found {
            Ok(vec![
                Value::Int(1),
                Value::Str("ready".into()),
                Value::Array(vec![
                    Value::Str("TCPROS".into()),
                    Value::Str(self.config.advertised_host.clone()),
                    Value::Int(self.data_port as i32),
                ]),
            ])
        } else {
            Ok(vec![Value::Int(0), Value::Str(format!("no publisher for {}", topic)), Value::Array(vec![])])
        }
    }

    fn publisher_update(&mut self, _caller_id: &str, topic: &str, publishers: &[Value]) -> crate::error::Result<Vec<Value>> {
        let subscriber_index = self.subscribers.iter().find(|(_, s)| s.topic == topic).map(|(i, _)| i);
        if let Some(index) = subscriber_index {
            let uris: Vec<String> = publishers.iter().filter_map(Value::as_str).map(String::from).collect();
            for uri in uris {
                self.negotiate_with_publisher(index, uri);
            }
        }
        Ok(vec![Value::Int(1), Value::Str("ok".into()), Value::Int(0)])
    }

    fn get_bus_info(&mut self, _caller_id: &str) -> crate::error::Result<Vec<Value>> {
        let mut connections = Vec::new();
        for (index, channel) in self.peer_channels.iter() {
            let direction = match channel.role() {
                ChannelRole::Subscriber | ChannelRole::ServiceCaller => "out",
                ChannelRole::Publisher | ChannelRole::ServiceProvider => "in",
            };
            let topic = channel
                .remote_header()
                .map(|h| h.topic.clone())
                .or_else(|| self.provider_for_peer.get(&index).and_then(|&p| self.service_providers.get(p)).map(|s| s.name.clone()))
                .or_else(|| self.publisher_for_peer.get(&index).and_then(|&p| self.publishers.get(p)).map(|s| s.topic.clone()))
                .unwrap_or_default();
            let destination_id = channel
                .remote_header()
                .map(|h| h.caller_id.clone())
                .or_else(|| channel.peer_addr().map(|a| a.to_string()))
                .unwrap_or_default();

            connections.push(Value::Array(vec![
                Value::Int(index as i32),
                Value::Str(destination_id),
                Value::Str(direction.to_string()),
                Value::Str("TCPROS".into()),
                Value::Str(topic),
                Value::Bool(!channel.is_closed()),
            ]));
        }

        Ok(vec![Value::Int(1), Value::Str("ok".into()), Value::Array(connections)])
    }

    fn shutdown(&mut self, _caller_id: &str, reason: &str) -> crate::error::Result<Vec<Value>> {
        slog::info!(self.logger, "shutdown requested by peer"; "reason" => reason);
        self.shutdown_requested = true;
        Ok(vec![Value::Int(1), Value::Str("ok".into()), Value::Int(0)])
    }
}

fn parse_host_port(uri: &str) -> crate::error::Result<(String, u16)> {
    let without_scheme = uri.splitn(2, "://").nth(1).unwrap_or(uri);
    let without_trailing_slash = without_scheme.trim_end_matches('/');
    let (host, port) = without_trailing_slash
        .rsplit_once(':')
        .ok_or_else(|| NodeError::with_detail(ErrorKind::BadArgument, format!("no port in URI `{}`", uri)))?;
    let port: u16 = port.parse().map_err(|_| NodeError::with_detail(ErrorKind::BadArgument, format!("invalid port in URI `{}`", uri)))?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_host_port_handles_scheme_and_trailing_slash() {
        assert_eq!(parse_host_port("http://localhost:11311/").unwrap(), ("localhost".to_string(), 11311));
        assert_eq!(parse_host_port("localhost:9000").unwrap(), ("localhost".to_string(), 9000));
    }

    #[test]
    fn parse_host_port_rejects_missing_port() {
        assert!(parse_host_port("http://localhost/").is_err());
    }
}
