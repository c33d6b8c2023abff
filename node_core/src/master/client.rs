//! Drives exactly one [`RosApiCall`] at a time over a non-blocking TCP socket: connect, write
//! the HTTP POST carrying the XML-RPC method call, read the HTTP response, XML-decode it, and
//! hand the result to the call's callback. On connection failure it retries with exponential
//! backoff up to a configured cap before surfacing a failure.

use crate::clock::Clock;
use crate::error::{ErrorKind, NodeError};
use crate::master::call::RosApiCall;
use crate::socket::ManagedSocket;
use crate::xmlrpc::{codec, http};
use mio::{Poll, Token};
use std::net::SocketAddr;
use std::time::Duration;

pub enum StepOutcome {
    /// The call is still connecting, writing, or waiting for a response.
    Pending,
    /// The call completed (successfully or not) and its callback has already run.
    Done,
}

struct Backoff {
    attempts: u32,
    current: Duration,
    initial: Duration,
    cap: Duration,
    retry_cap: u32,
    next_attempt_at_micros: u64,
}

impl Backoff {
    fn new(initial: Duration, cap: Duration, retry_cap: u32) -> Backoff {
        Backoff {
            attempts: 0,
            current: initial,
            initial,
            cap,
            retry_cap,
            next_attempt_at_micros: 0,
        }
    }

    fn record_failure(&mut self, now_micros: u64) -> bool {
        self.attempts += 1;
        self.next_attempt_at_micros = now_micros + self.current.as_micros() as u64;
        self.current = (self.current * 2).min(self.cap);
        self.attempts < self.retry_cap
    }

    fn reset(&mut self) {
        self.attempts = 0;
        self.current = self.initial;
    }

    fn ready(&self, now_micros: u64) -> bool {
        now_micros >= self.next_attempt_at_micros
    }
}

pub struct MasterCallClient {
    token: Token,
    backoff: Backoff,
    call: Option<RosApiCall>,
    socket: Option<ManagedSocket>,
    parser: http::HttpMessageParser,
    request_queued: bool,
}

impl MasterCallClient {
    pub fn new(token: Token, backoff_initial: Duration, backoff_cap: Duration, retry_cap: u32) -> MasterCallClient {
        MasterCallClient {
            token,
            backoff: Backoff::new(backoff_initial, backoff_cap, retry_cap),
            call: None,
            socket: None,
            parser: http::HttpMessageParser::new(),
            request_queued: false,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn is_idle(&self) -> bool {
        self.call.is_none()
    }

    /// Takes ownership of the next call to run. The caller (the event loop) must not submit a
    /// second call while this one is in flight - at most one master call is ever in flight.
    pub fn submit(&mut self, call: RosApiCall, poll: &Poll) -> crate::error::Result<()> {
        self.call = Some(call);
        self.backoff.reset();
        self.parser = http::HttpMessageParser::new();
        self.request_queued = false;
        self.open_socket(poll)
    }

    fn open_socket(&mut self, poll: &Poll) -> crate::error::Result<()> {
        let call = self.call.as_ref().expect("open_socket called without a call");
        let addr: SocketAddr = format!("{}:{}", call.host, call.port)
            .parse()
            .map_err(|_| NodeError::with_detail(ErrorKind::BadArgument, "invalid host/port for RPC target"))?;
        self.socket = Some(ManagedSocket::connect(addr, self.token, poll)?);
        Ok(())
    }

    /// Advances the in-flight call by one step. Should be called when this client's token
    /// reports readiness, and also periodically so backoff deadlines can be checked.
    pub fn advance(&mut self, poll: &Poll, clock: &dyn Clock) -> crate::error::Result<StepOutcome> {
        if self.call.is_none() {
            return Ok(StepOutcome::Done);
        }

        let socket = match self.socket.as_mut() {
            Some(socket) => socket,
            None => {
                if self.backoff.ready(clock.now_micros()) {
                    self.open_socket(poll)?;
                }
                return Ok(StepOutcome::Pending);
            }
        };

        if !socket.is_connected() {
            if let Err(e) = socket.confirm_connected() {
                return self.fail_attempt(poll, clock, e);
            }
        }

        if socket.is_connected() && !self.request_queued {
            let call = self.call.as_ref().unwrap();
            let body = codec::encode_method_call(call.method.method_name(), &call.params);
            let request = http::build_post_request(&call.host, call.port, "/RPC2", &body);
            socket.outbound.push_bytes(&request);
            self.request_queued = true;
        }

        if let Err(e) = socket.pump_outbound() {
            return self.fail_attempt(poll, clock, e);
        }

        if let Err(e) = socket.pump_inbound() {
            return self.fail_attempt(poll, clock, e);
        }

        let raw = socket.inbound.peek(socket.inbound.len());
        match self.parser.try_parse(&raw) {
            Ok(Some((status_line, body))) => {
                let result = http::parse_status_code(&status_line)
                    .and_then(|status| {
                        if status == 200 {
                            Ok(())
                        } else {
                            Err(NodeError::with_detail(ErrorKind::RpcServerRefused, format!("HTTP status {}", status)))
                        }
                    })
                    .and_then(|_| codec::decode_method_response(&body));
                self.finish(poll, result)
            }
            Ok(None) => Ok(StepOutcome::Pending),
            Err(e) => self.fail_attempt(poll, clock, e),
        }
    }

    fn fail_attempt(&mut self, poll: &Poll, clock: &dyn Clock, error: NodeError) -> crate::error::Result<StepOutcome> {
        if let Some(socket) = self.socket.take() {
            let _ = socket.deregister(poll);
        }
        self.request_queued = false;
        self.parser = http::HttpMessageParser::new();

        let can_retry = self.backoff.record_failure(clock.now_micros());
        if can_retry {
            Ok(StepOutcome::Pending)
        } else {
            self.finish(poll, Err(error.layer(ErrorKind::MasterUnreachable)))
        }
    }

    fn finish(&mut self, poll: &Poll, result: crate::error::Result<Vec<crate::xmlrpc::Value>>) -> crate::error::Result<StepOutcome> {
        if let Some(socket) = self.socket.take() {
            let _ = socket.deregister(poll);
        }
        let call = self.call.take().expect("finish called without a call");
        let provider_index = call.provider_index;
        (call.on_result)(result, provider_index);
        Ok(StepOutcome::Done)
    }
}
