//! The peer data channel state machine: header exchange followed by a framed data phase, for
//! both the connecting (subscriber / service-caller) and accepting (publisher / service-provider)
//! sides of a connection. One [`PeerChannel`] owns exactly one socket and advances by at most one
//! state transition's worth of work per [`PeerChannel::advance`] call, same as every other state
//! machine the event loop drives.

use crate::clock::Clock;
use crate::error::{ErrorKind, NodeError};
use crate::peer::frame::{encode_data_frame, encode_service_response, try_decode_data_frame, try_decode_service_response};
use crate::peer::header::ChannelHeader;
use crate::socket::ManagedSocket;
use mio::{Poll, Token};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

/// Expected-MD5 sentinel for the accepting side of a connection: the header phase can't know
/// which registered publisher/service a freshly accepted socket is for until the remote header
/// names it, so acceptance defers the MD5 check to the caller (`Node`) instead of this state
/// machine enforcing one up front.
pub const ANY_MD5: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Subscriber,
    Publisher,
    ServiceCaller,
    ServiceProvider,
}

impl ChannelRole {
    fn is_service(self) -> bool {
        matches!(self, ChannelRole::ServiceCaller | ChannelRole::ServiceProvider)
    }

    fn initiates_connection(self) -> bool {
        matches!(self, ChannelRole::Subscriber | ChannelRole::ServiceCaller)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Accepted,
    WritingHeader,
    ReadingHeader,
    ReadingSize,
    ReadingPayload,
    WritingPayload,
    Closed,
}

#[derive(Debug)]
pub enum ChannelEvent {
    HeaderExchanged(ChannelHeader),
    MessageReceived(Vec<u8>),
    ServiceRequestReceived(Vec<u8>),
    ServiceResponseReceived { ok: bool, payload: Vec<u8> },
    Closed(NodeError),
}

/// Outcome of a publish/request attempt against the outbound side of a channel.
pub enum SendOutcome {
    Sent,
    Queued,
    Dropped,
}

pub struct PeerChannel {
    role: ChannelRole,
    state: ChannelState,
    socket: Option<ManagedSocket>,
    token: Token,
    addr: Option<SocketAddr>,
    local_header: ChannelHeader,
    remote_header: Option<ChannelHeader>,
    expected_md5: String,
    high_water_mark: usize,
    queue_capacity: usize,
    pending_messages: VecDeque<Vec<u8>>,
    backoff_initial: Duration,
    backoff_cap: Duration,
    current_backoff: Duration,
    reconnect_at_micros: u64,
}

impl PeerChannel {
    /// Builds a channel that will dial out to `addr` once driven (subscriber / service-caller
    /// side).
    pub fn connecting(
        role: ChannelRole,
        token: Token,
        addr: SocketAddr,
        local_header: ChannelHeader,
        expected_md5: String,
        high_water_mark: usize,
        queue_capacity: usize,
        backoff_initial: Duration,
        backoff_cap: Duration,
    ) -> PeerChannel {
        PeerChannel {
            role,
            state: ChannelState::Idle,
            socket: None,
            token,
            addr: Some(addr),
            local_header,
            remote_header: None,
            expected_md5,
            high_water_mark,
            queue_capacity,
            pending_messages: VecDeque::new(),
            backoff_initial,
            backoff_cap,
            current_backoff: backoff_initial,
            reconnect_at_micros: 0,
        }
    }

    /// Builds a channel around an already-accepted socket (publisher / service-provider side).
    pub fn accepted(
        role: ChannelRole,
        socket: ManagedSocket,
        local_header: ChannelHeader,
        expected_md5: String,
        high_water_mark: usize,
        queue_capacity: usize,
    ) -> PeerChannel {
        let token = socket.token();
        PeerChannel {
            role,
            state: ChannelState::Accepted,
            socket: Some(socket),
            token,
            addr: None,
            local_header,
            remote_header: None,
            expected_md5,
            high_water_mark,
            queue_capacity,
            pending_messages: VecDeque::new(),
            backoff_initial: Duration::from_millis(100),
            backoff_cap: Duration::from_secs(4),
            current_backoff: Duration::from_millis(100),
            reconnect_at_micros: 0,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ChannelState::Closed
    }

    /// The remote side's header, once exchanged - `None` before that or after the channel closes
    /// without ever completing one.
    pub fn remote_header(&self) -> Option<&ChannelHeader> {
        self.remote_header.as_ref()
    }

    /// Best-effort peer address: the dial target for a connecting channel, or the accepted
    /// socket's actual peer address otherwise.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.addr.or_else(|| self.socket.as_ref().and_then(|s| s.peer_addr().ok()))
    }

    /// Queue a frame (pre-encoded payload, not yet length-prefixed) for delivery. Above the
    /// configured high-water mark, frames are queued and the oldest is dropped once the queue is
    /// also full - the FIFO drop-oldest discipline.
    pub fn send_message(&mut self, payload: &[u8]) -> SendOutcome {
        self.enqueue(encode_data_frame(payload))
    }

    pub fn send_service_response(&mut self, ok: bool, payload: &[u8]) -> SendOutcome {
        self.enqueue(encode_service_response(ok, payload))
    }

    fn enqueue(&mut self, framed: Vec<u8>) -> SendOutcome {
        if let Some(socket) = self.socket.as_mut() {
            if socket.outbound.len() + framed.len() <= self.high_water_mark {
                socket.outbound.push_bytes(&framed);
                return SendOutcome::Sent;
            }
        }

        let mut dropped = false;
        if self.pending_messages.len() >= self.queue_capacity {
            self.pending_messages.pop_front();
            dropped = true;
        }
        self.pending_messages.push_back(framed);
        if dropped {
            SendOutcome::Dropped
        } else {
            SendOutcome::Queued
        }
    }

    fn drain_pending(&mut self) {
        let socket = match self.socket.as_mut() {
            Some(socket) => socket,
            None => return,
        };
        while let Some(front) = self.pending_messages.front() {
            if socket.outbound.len() + front.len() > self.high_water_mark {
                break;
            }
            let framed = self.pending_messages.pop_front().unwrap();
            socket.outbound.push_bytes(&framed);
        }
    }

    /// Advances the state machine by as much work as is currently available without blocking,
    /// returning every event produced along the way.
    pub fn advance(&mut self, poll: &Poll, clock: &dyn Clock) -> crate::error::Result<Vec<ChannelEvent>> {
        let mut events = Vec::new();

        if self.state == ChannelState::Idle {
            if clock.now_micros() < self.reconnect_at_micros {
                return Ok(events);
            }
            match self.open_outbound(poll) {
                Ok(()) => self.state = ChannelState::Connecting,
                Err(e) => {
                    self.schedule_reconnect(clock);
                    events.push(ChannelEvent::Closed(e));
                    return Ok(events);
                }
            }
        }

        if self.state == ChannelState::Connecting {
            let connected = match self.socket.as_mut() {
                Some(socket) => {
                    if socket.is_connected() {
                        true
                    } else {
                        match socket.confirm_connected() {
                            Ok(()) => true,
                            Err(_) => false,
                        }
                    }
                }
                None => false,
            };
            if connected {
                self.queue_local_header();
                self.state = ChannelState::WritingHeader;
            }
        }

        if let Err(e) = self.pump(poll) {
            events.push(self.close(poll, e));
            return Ok(events);
        }

        if self.state == ChannelState::Accepted {
            self.state = ChannelState::ReadingHeader;
        }

        if self.state == ChannelState::WritingHeader {
            let flushed = self.socket.as_ref().map(|s| s.outbound.is_empty()).unwrap_or(false);
            if flushed {
                self.state = if self.role.initiates_connection() {
                    ChannelState::ReadingHeader
                } else {
                    ChannelState::WritingPayload
                };
            }
        }

        if self.state == ChannelState::ReadingHeader {
            match self.try_read_header() {
                Ok(Some(header)) => {
                    if self.expected_md5 != ANY_MD5 && header.md5 != self.expected_md5 {
                        let err = NodeError::with_detail(
                            ErrorKind::ProtocolMd5Mismatch,
                            format!("expected md5 {}, peer offered {}", self.expected_md5, header.md5),
                        );
                        events.push(self.close(poll, err));
                        return Ok(events);
                    }
                    self.remote_header = Some(header.clone());
                    events.push(ChannelEvent::HeaderExchanged(header));
                    self.current_backoff = self.backoff_initial;

                    self.state = if self.role.initiates_connection() {
                        ChannelState::ReadingSize
                    } else {
                        self.queue_local_header();
                        ChannelState::WritingHeader
                    };
                }
                Ok(None) => {}
                Err(e) => {
                    events.push(self.close(poll, e));
                    return Ok(events);
                }
            }
        }

        // WritingPayload is the accepting side's steady state and reads frames too - a service
        // provider's accepted connection never visits ReadingSize/ReadingPayload on its own, so
        // without this it would write responses but never see incoming requests.
        if matches!(self.state, ChannelState::ReadingSize | ChannelState::ReadingPayload | ChannelState::WritingPayload) {
            loop {
                match self.try_read_frame() {
                    Ok(Some(event)) => events.push(event),
                    Ok(None) => break,
                    Err(e) => {
                        events.push(self.close(poll, e));
                        return Ok(events);
                    }
                }
            }
        }

        if self.state == ChannelState::WritingPayload {
            self.drain_pending();
            if let Err(e) = self.pump(poll) {
                events.push(self.close(poll, e));
            }
        }

        Ok(events)
    }

    fn open_outbound(&mut self, poll: &Poll) -> crate::error::Result<()> {
        let addr = self.addr.expect("open_outbound called on an accepted channel");
        self.socket = Some(ManagedSocket::connect(addr, self.token, poll)?);
        Ok(())
    }

    fn queue_local_header(&mut self) {
        let encoded = self.local_header.encode();
        if let Some(socket) = self.socket.as_mut() {
            socket.outbound.push_bytes(&encoded);
        }
    }

    fn pump(&mut self, _poll: &Poll) -> crate::error::Result<()> {
        self.drain_pending();
        if let Some(socket) = self.socket.as_mut() {
            socket.pump_outbound()?;
            socket.pump_inbound()?;
        }
        Ok(())
    }

    fn try_read_header(&mut self) -> crate::error::Result<Option<ChannelHeader>> {
        let socket = match self.socket.as_mut() {
            Some(socket) => socket,
            None => return Ok(None),
        };
        if socket.inbound.len() < 4 {
            return Ok(None);
        }
        let prefix = socket.inbound.peek(4);
        let total_len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        if socket.inbound.len() < 4 + total_len {
            return Ok(None);
        }
        let buffered = socket.inbound.peek(4 + total_len);
        let header = ChannelHeader::decode(&buffered[4..])?;
        socket.inbound.take(4 + total_len);
        Ok(Some(header))
    }

    fn try_read_frame(&mut self) -> crate::error::Result<Option<ChannelEvent>> {
        let socket = match self.socket.as_mut() {
            Some(socket) => socket,
            None => return Ok(None),
        };
        let buffered = socket.inbound.peek(socket.inbound.len());

        // A service request travels in the plain data-frame format; only the response leg
        // carries the leading ok/fail byte, so the two sides of a service channel decode their
        // inbound frames differently even though they share a socket and a role enum.
        match self.role {
            ChannelRole::ServiceProvider => match try_decode_data_frame(&buffered)? {
                Some((payload, consumed)) => {
                    socket.inbound.take(consumed);
                    Ok(Some(ChannelEvent::ServiceRequestReceived(payload)))
                }
                None => Ok(None),
            },
            ChannelRole::ServiceCaller => match try_decode_service_response(&buffered)? {
                Some((ok, payload, consumed)) => {
                    socket.inbound.take(consumed);
                    Ok(Some(ChannelEvent::ServiceResponseReceived { ok, payload }))
                }
                None => Ok(None),
            },
            ChannelRole::Subscriber | ChannelRole::Publisher => match try_decode_data_frame(&buffered)? {
                Some((payload, consumed)) => {
                    socket.inbound.take(consumed);
                    Ok(Some(ChannelEvent::MessageReceived(payload)))
                }
                None => Ok(None),
            },
        }
    }

    /// Tears the channel down cleanly with no error and no reconnect attempt - used by a
    /// non-persistent service caller once its response has arrived.
    pub fn force_close(&mut self, poll: &Poll) {
        if let Some(socket) = self.socket.take() {
            let _ = socket.deregister(poll);
        }
        self.state = ChannelState::Closed;
    }

    fn schedule_reconnect(&mut self, clock: &dyn Clock) {
        self.reconnect_at_micros = clock.now_micros() + self.current_backoff.as_micros() as u64;
        self.current_backoff = (self.current_backoff * 2).min(self.backoff_cap);
    }

    fn close(&mut self, poll: &Poll, error: NodeError) -> ChannelEvent {
        if let Some(socket) = self.socket.take() {
            let _ = socket.deregister(poll);
        }
        self.remote_header = None;

        if self.role.initiates_connection() && !self.local_header.persistent {
            self.state = ChannelState::Closed;
        } else if self.role.initiates_connection() {
            // Persistent subscribers/service-callers re-enter CONNECTING after backoff rather
            // than terminating outright.
            self.state = ChannelState::Idle;
        } else {
            self.state = ChannelState::Closed;
        }

        ChannelEvent::Closed(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use mio::net::TcpListener;

    fn header(topic: &str, md5: &str) -> ChannelHeader {
        ChannelHeader {
            topic: topic.into(),
            message_type: "std_msgs/String".into(),
            md5: md5.into(),
            caller_id: "/n".into(),
            latching: false,
            persistent: false,
        }
    }

    #[test]
    fn subscriber_channel_exchanges_header_and_receives_message() {
        let poll = Poll::new().unwrap();
        let clock = VirtualClock::new();

        let listener = TcpListener::bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        poll.register(&listener, Token(0), mio::Ready::readable(), mio::PollOpt::edge()).unwrap();

        let mut subscriber = PeerChannel::connecting(
            ChannelRole::Subscriber,
            Token(1),
            addr,
            header("/chatter", "md5abc"),
            "md5abc".into(),
            1024 * 1024,
            8,
            Duration::from_millis(100),
            Duration::from_secs(4),
        );

        // Drive connect + header write.
        subscriber.advance(&poll, &clock).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        let mut server_socket = ManagedSocket::from_accepted(accepted, Token(2), &poll).unwrap();

        subscriber.advance(&poll, &clock).unwrap();
        server_socket.pump_inbound().unwrap();
        assert!(server_socket.inbound.len() > 0);

        let incoming_header_bytes = server_socket.inbound.take(server_socket.inbound.len());
        let parsed = ChannelHeader::decode(&incoming_header_bytes[4..]).unwrap();
        assert_eq!(parsed.topic, "/chatter");

        let reply_header = header("/chatter", "md5abc");
        server_socket.outbound.push_bytes(&reply_header.encode());
        server_socket.outbound.push_bytes(&encode_data_frame(b"hello"));
        server_socket.pump_outbound().unwrap();

        let mut events = Vec::new();
        for _ in 0..5 {
            events.extend(subscriber.advance(&poll, &clock).unwrap());
        }

        assert!(events.iter().any(|e| matches!(e, ChannelEvent::HeaderExchanged(_))));
        assert!(events.iter().any(|e| matches!(e, ChannelEvent::MessageReceived(payload) if payload == b"hello")));
    }

    #[test]
    fn md5_mismatch_closes_channel_with_protocol_error() {
        let poll = Poll::new().unwrap();
        let clock = VirtualClock::new();

        let listener = TcpListener::bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        poll.register(&listener, Token(0), mio::Ready::readable(), mio::PollOpt::edge()).unwrap();

        let mut subscriber = PeerChannel::connecting(
            ChannelRole::Subscriber,
            Token(1),
            addr,
            header("/chatter", "expected-md5"),
            "expected-md5".into(),
            1024,
            4,
            Duration::from_millis(100),
            Duration::from_secs(4),
        );

        subscriber.advance(&poll, &clock).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        let mut server_socket = ManagedSocket::from_accepted(accepted, Token(2), &poll).unwrap();
        subscriber.advance(&poll, &clock).unwrap();
        server_socket.pump_inbound().unwrap();

        server_socket.outbound.push_bytes(&header("/chatter", "stale-md5").encode());
        server_socket.pump_outbound().unwrap();

        let mut events = Vec::new();
        for _ in 0..5 {
            events.extend(subscriber.advance(&poll, &clock).unwrap());
        }

        let closed = events.iter().find_map(|e| match e {
            ChannelEvent::Closed(err) => Some(err.clone()),
            _ => None,
        });
        assert_eq!(closed.unwrap().primary(), ErrorKind::ProtocolMd5Mismatch);
    }

    #[test]
    fn backpressure_queues_then_drops_oldest_when_full() {
        let poll = Poll::new().unwrap();
        let listener = TcpListener::bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let mut channel = PeerChannel::connecting(
            ChannelRole::Subscriber,
            Token(5),
            addr,
            header("/t", "m"),
            "m".into(),
            1,
            2,
            Duration::from_millis(100),
            Duration::from_secs(4),
        );
        // No socket yet (Idle state) - every send goes straight to the pending queue.
        assert!(matches!(channel.send_message(b"a"), SendOutcome::Queued));
        assert!(matches!(channel.send_message(b"b"), SendOutcome::Queued));
        assert!(matches!(channel.send_message(b"c"), SendOutcome::Dropped));
        assert_eq!(channel.pending_messages.len(), 2);
    }
}
