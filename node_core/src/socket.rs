//! Thin non-blocking TCP wrapper shared by the master API call client and peer data channels.
//! Owns the raw `mio` socket plus the inbound/outbound [`ByteBuffer`]s so every connected state
//! machine in the crate buffers, registers for readiness, and drains its sockets the same way.

use crate::buffer::ByteBuffer;
use crate::error::{ErrorKind, NodeError};
use mio::net::TcpStream;
use mio::{Poll, PollOpt, Ready, Token};
use std::io;
use std::net::SocketAddr;

/// A connected (or connecting) non-blocking socket with its own read/write buffers.
pub struct ManagedSocket {
    stream: TcpStream,
    token: Token,
    pub inbound: ByteBuffer,
    pub outbound: ByteBuffer,
    connected: bool,
}

impl ManagedSocket {
    /// Starts a non-blocking connect and registers the socket with `poll` under `token`,
    /// interested in both readability (connect completion, incoming data) and writability
    /// (connect completion, outgoing backpressure).
    pub fn connect(addr: SocketAddr, token: Token, poll: &Poll) -> crate::error::Result<ManagedSocket> {
        let stream = TcpStream::connect(&addr).map_err(|e| NodeError::from(e).layer(ErrorKind::MasterUnreachable))?;
        poll.register(&stream, token, Ready::readable() | Ready::writable(), PollOpt::edge())
            .map_err(NodeError::from)?;

        Ok(ManagedSocket {
            stream,
            token,
            inbound: ByteBuffer::new(),
            outbound: ByteBuffer::new(),
            connected: false,
        })
    }

    /// Wraps an already-accepted stream (the peer-negotiation and peer-data server sides) and
    /// registers it with `poll`.
    pub fn from_accepted(stream: TcpStream, token: Token, poll: &Poll) -> crate::error::Result<ManagedSocket> {
        poll.register(&stream, token, Ready::readable() | Ready::writable(), PollOpt::edge())
            .map_err(NodeError::from)?;

        Ok(ManagedSocket {
            stream,
            token,
            inbound: ByteBuffer::new(),
            outbound: ByteBuffer::new(),
            connected: true,
        })
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// True once the non-blocking connect has completed successfully, per `take_error`/a
    /// writable event. Peer-accepted sockets are considered connected from construction.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Call on a writable readiness event while still connecting; confirms the connect finished
    /// and clears any pending socket error.
    pub fn confirm_connected(&mut self) -> crate::error::Result<()> {
        match self.stream.take_error() {
            Ok(None) => {
                self.connected = true;
                Ok(())
            }
            Ok(Some(e)) => Err(NodeError::from(e).layer(ErrorKind::MasterUnreachable)),
            Err(e) => Err(NodeError::from(e).layer(ErrorKind::MasterUnreachable)),
        }
    }

    /// Drain as much as is available from the OS socket into `inbound`. Never blocks.
    pub fn pump_inbound(&mut self) -> crate::error::Result<usize> {
        self.inbound.ingress(&mut self.stream).map_err(NodeError::from)
    }

    /// Push as much of `outbound` to the OS socket as it will currently accept. Never blocks.
    pub fn pump_outbound(&mut self) -> crate::error::Result<usize> {
        self.outbound.egress(&mut self.stream).map_err(NodeError::from)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.stream.set_nodelay(nodelay)
    }

    pub fn deregister(&self, poll: &Poll) -> crate::error::Result<()> {
        poll.deregister(&self.stream).map_err(NodeError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::TcpListener;
    use mio::Events;
    use std::net::TcpStream as StdTcpStream;

    #[test]
    fn connect_and_exchange_bytes_over_loopback() {
        let listener = TcpListener::bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let poll = Poll::new().unwrap();
        poll.register(&listener, Token(0), Ready::readable(), PollOpt::edge()).unwrap();

        let mut client = ManagedSocket::connect(addr, Token(1), &poll).unwrap();
        client.outbound.push_bytes(b"hello");

        let mut events = Events::with_capacity(16);
        poll.poll(&mut events, None).unwrap();

        let (accepted, _) = listener.accept().unwrap();
        let mut server = ManagedSocket::from_accepted(accepted, Token(2), &poll).unwrap();

        client.confirm_connected().unwrap();
        client.pump_outbound().unwrap();

        poll.poll(&mut events, None).unwrap();
        server.pump_inbound().unwrap();

        assert_eq!(server.inbound.take(5), b"hello".to_vec());
        drop(StdTcpStream::connect(addr).ok());
    }
}
