//! Protocol Endpoint (WebSocket-compatible)
//!
//! Each accepted socket runs Handshaking -> Open -> Closed. Sends are
//! immediate best-effort writes; there is no outbound queue.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use anyhow::{Context, Result};
use mio::net::{TcpListener, TcpStream};
use nix::sys::socket::{
    bind, listen, setsockopt, socket, sockopt, AddressFamily, Backlog, SockFlag, SockType, SockaddrIn, SockaddrIn6,
};
use qaryx_proto::{accept_key, decode_frame, encode_text, extract_key, find_header_end, upgrade_response, Opcode};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;

/// Size of each connection's receive accumulation buffer
pub const RECV_BUFFER: usize = 4096;

/// Largest frame header: 2 + 8 (length) + 4 (mask)
const MAX_FRAME_HEADER: usize = 14;

/// Largest payload that still fits the receive buffer with its header
pub const MAX_PAYLOAD: usize = RECV_BUFFER - MAX_FRAME_HEADER;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Handshaking,
    Open,
    Closed,
}

/// One protocol connection over any byte stream
pub struct Connection<S> {
    stream: S,
    state: ConnectionState,
    buf: Vec<u8>,
}

impl<S: Read + Write> Connection<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            state: ConnectionState::Handshaking,
            buf: Vec::with_capacity(RECV_BUFFER),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    /// Read everything available and return the complete messages it carried.
    ///
    /// Drains until the stream would block. A 0-byte read or a read error
    /// closes the connection.
    pub fn on_readable(&mut self) -> Vec<Vec<u8>> {
        let mut messages = Vec::new();
        let mut chunk = [0u8; RECV_BUFFER];

        while self.state != ConnectionState::Closed {
            let room = RECV_BUFFER - self.buf.len();
            if room == 0 {
                // only an unterminated handshake can fill the buffer
                warn!("Receive buffer full while handshaking, closing");
                self.close();
                break;
            }

            match self.stream.read(&mut chunk[..room]) {
                Ok(0) => {
                    debug!("Peer closed");
                    self.close();
                }
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    self.process(&mut messages);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("Read failed: {}", e);
                    self.close();
                }
            }
        }

        messages
    }

    /// Send one text frame. Returns false (and closes) if the write fails or
    /// would block.
    pub fn send(&mut self, text: &str) -> bool {
        if self.state != ConnectionState::Open {
            return false;
        }
        let frame = encode_text(text.as_bytes());
        self.write_or_close(&frame)
    }

    fn write_or_close(&mut self, bytes: &[u8]) -> bool {
        match self.stream.write_all(bytes) {
            Ok(()) => true,
            Err(e) => {
                debug!("Send failed: {}", e);
                self.close();
                false
            }
        }
    }

    fn close(&mut self) {
        self.state = ConnectionState::Closed;
        self.buf.clear();
    }

    fn process(&mut self, messages: &mut Vec<Vec<u8>>) {
        if self.state == ConnectionState::Handshaking && !self.handshake() {
            return;
        }
        if self.state == ConnectionState::Open {
            self.decode_frames(messages);
        }
    }

    /// Returns true once the connection is Open
    fn handshake(&mut self) -> bool {
        let Some(end) = find_header_end(&self.buf) else {
            return false;
        };
        let Some(key) = extract_key(&self.buf[..end]) else {
            // malformed request: keep waiting, the buffer bound closes it eventually
            debug!("Handshake without key");
            return false;
        };

        let response = upgrade_response(&accept_key(&key));
        if !self.write_or_close(response.as_bytes()) {
            return false;
        }
        self.buf.drain(..end);
        self.state = ConnectionState::Open;
        debug!("Handshake complete");
        true
    }

    fn decode_frames(&mut self, messages: &mut Vec<Vec<u8>>) {
        let mut consumed = 0;

        while self.state == ConnectionState::Open {
            match decode_frame(&self.buf[consumed..], MAX_PAYLOAD) {
                Ok(Some((frame, used))) => {
                    consumed += used;
                    if frame.is_message() {
                        messages.push(frame.payload);
                    } else if frame.opcode == Opcode::Close {
                        debug!("Close frame received");
                        self.close();
                        return;
                    } else {
                        debug!("Ignoring {:?} frame", frame.opcode);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Dropping connection: {}", e);
                    self.close();
                    return;
                }
            }
        }

        self.buf.drain(..consumed);
    }
}

impl<S: AsRawFd> Connection<S> {
    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

/// Listening socket plus the table of live connections
pub struct Endpoint {
    listener: TcpListener,
    connections: BTreeMap<ConnectionId, Connection<TcpStream>>,
    next_id: u64,
    max_clients: usize,
}

impl Endpoint {
    /// Bind the listening socket: dual-stack IPv6 first, IPv4 fallback
    pub fn bind(config: &ServerConfig) -> Result<Self> {
        let fd = match bind_dual_stack(config.port, config.listen_backlog) {
            Ok(fd) => fd,
            Err(e) => {
                warn!("IPv6 listen failed ({}), falling back to IPv4", e);
                bind_ipv4(config.port, config.listen_backlog)
                    .with_context(|| format!("Failed to listen on port {}", config.port))?
            }
        };
        let listener = TcpListener::from_std(std::net::TcpListener::from(fd));
        info!("Listening on {}", listener.local_addr().context("Failed to read listen address")?);

        Ok(Self {
            listener,
            connections: BTreeMap::new(),
            next_id: 0,
            max_clients: config.max_clients,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn listener_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    /// Accept every pending connection. Returns the ids of the admitted ones;
    /// connections beyond the client cap are closed straight away.
    pub fn accept(&mut self) -> Vec<ConnectionId> {
        let mut admitted = Vec::new();

        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.connections.len() >= self.max_clients {
                        warn!("Rejecting {}: {} clients connected", peer, self.connections.len());
                        continue;
                    }
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("TCP_NODELAY on {}: {}", peer, e);
                    }
                    let id = ConnectionId(self.next_id);
                    self.next_id += 1;
                    info!("Client {} connected from {}", id, peer);
                    self.connections.insert(id, Connection::new(stream));
                    admitted.push(id);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    break;
                }
            }
        }

        admitted
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection<TcpStream>> {
        self.connections.get(&id)
    }

    /// Feed readable bytes into a connection, returning its decoded messages
    pub fn on_readable(&mut self, id: ConnectionId) -> Vec<Vec<u8>> {
        self.connections
            .get_mut(&id)
            .map(Connection::on_readable)
            .unwrap_or_default()
    }

    /// Send to every Open connection
    pub fn broadcast(&mut self, text: &str) {
        for conn in self.connections.values_mut() {
            if conn.state() == ConnectionState::Open {
                conn.send(text);
            }
        }
    }

    /// Send to one connection
    pub fn send(&mut self, id: ConnectionId, text: &str) -> bool {
        match self.connections.get_mut(&id) {
            Some(conn) => conn.send(text),
            None => false,
        }
    }

    /// Drop a connection outright
    pub fn remove(&mut self, id: ConnectionId) {
        if self.connections.remove(&id).is_some() {
            debug!("Client {} removed", id);
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Remove Closed connections; the caller deregisters them before they drop
    pub fn take_closed(&mut self) -> Vec<(ConnectionId, Connection<TcpStream>)> {
        let closed: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.is_closed())
            .map(|(id, _)| *id)
            .collect();

        closed
            .into_iter()
            .filter_map(|id| {
                info!("Client {} disconnected", id);
                self.connections.remove(&id).map(|conn| (id, conn))
            })
            .collect()
    }

    /// Remove every connection (shutdown)
    pub fn take_all(&mut self) -> Vec<(ConnectionId, Connection<TcpStream>)> {
        std::mem::take(&mut self.connections).into_iter().collect()
    }
}

fn listen_socket(family: AddressFamily) -> nix::Result<OwnedFd> {
    let fd = socket(
        family,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    setsockopt(&fd, sockopt::ReuseAddr, &true)?;
    Ok(fd)
}

fn bind_dual_stack(port: u16, backlog: i32) -> nix::Result<OwnedFd> {
    let fd = listen_socket(AddressFamily::Inet6)?;
    setsockopt(&fd, sockopt::Ipv6V6Only, &false)?;
    let addr = SockaddrIn6::from(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0));
    bind(fd.as_raw_fd(), &addr)?;
    listen(&fd, Backlog::new(backlog)?)?;
    Ok(fd)
}

fn bind_ipv4(port: u16, backlog: i32) -> nix::Result<OwnedFd> {
    let fd = listen_socket(AddressFamily::Inet)?;
    let addr = SockaddrIn::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    bind(fd.as_raw_fd(), &addr)?;
    listen(&fd, Backlog::new(backlog)?)?;
    Ok(fd)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Duration;

    const REQUEST: &str = "GET /ws HTTP/1.1\r\nHost: box\r\nUpgrade: websocket\r\n\
                           Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                           Sec-WebSocket-Version: 13\r\n\r\n";

    /// Scripted peer: each read returns the next chunk, then WouldBlock
    #[derive(Default)]
    pub(crate) struct MemStream {
        pub(crate) incoming: VecDeque<Vec<u8>>,
        pub(crate) eof: bool,
        pub(crate) written: Vec<u8>,
        pub(crate) fail_writes: bool,
    }

    impl MemStream {
        pub(crate) fn push(&mut self, bytes: impl Into<Vec<u8>>) {
            self.incoming.push_back(bytes.into());
        }
    }

    impl Read for MemStream {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            let Some(mut chunk) = self.incoming.pop_front() else {
                return if self.eof { Ok(0) } else { Err(io::ErrorKind::WouldBlock.into()) };
            };
            let n = chunk.len().min(out.len());
            out[..n].copy_from_slice(&chunk[..n]);
            if n < chunk.len() {
                self.incoming.push_front(chunk.split_off(n));
            }
            Ok(n)
        }
    }

    impl Write for MemStream {
        fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
            if self.fail_writes {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.written.extend_from_slice(bytes);
            Ok(bytes.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Client-side masked frame
    pub(crate) fn masked(opcode: u8, payload: &[u8]) -> Vec<u8> {
        let mask = [0x11, 0x22, 0x33, 0x44];
        let mut out = vec![0x80 | opcode];
        match payload.len() {
            n if n < 126 => out.push(0x80 | n as u8),
            n if n <= 0xffff => {
                out.push(0x80 | 126);
                out.extend_from_slice(&(n as u16).to_be_bytes());
            }
            n => {
                out.push(0x80 | 127);
                out.extend_from_slice(&(n as u64).to_be_bytes());
            }
        }
        out.extend_from_slice(&mask);
        out.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
        out
    }

    fn open_connection() -> Connection<MemStream> {
        let mut conn = Connection::new(MemStream::default());
        conn.stream.push(REQUEST);
        assert!(conn.on_readable().is_empty());
        assert_eq!(conn.state(), ConnectionState::Open);
        conn.stream.written.clear();
        conn
    }

    #[test]
    fn test_handshake_replies_with_accept_token() {
        let mut conn = Connection::new(MemStream::default());
        conn.stream.push(&REQUEST.as_bytes()[..20]);
        conn.on_readable();
        assert_eq!(conn.state(), ConnectionState::Handshaking);
        assert!(conn.stream.written.is_empty());

        conn.stream.push(&REQUEST.as_bytes()[20..]);
        conn.on_readable();
        assert_eq!(conn.state(), ConnectionState::Open);
        let reply = String::from_utf8(conn.stream.written.clone()).unwrap();
        assert!(reply.starts_with("HTTP/1.1 101"));
        assert!(reply.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
    }

    #[test]
    fn test_handshake_without_key_keeps_waiting() {
        let mut conn = Connection::new(MemStream::default());
        conn.stream.push("GET / HTTP/1.1\r\nHost: box\r\n\r\n");
        conn.on_readable();
        assert_eq!(conn.state(), ConnectionState::Handshaking);
        assert!(conn.stream.written.is_empty());
    }

    #[test]
    fn test_unterminated_handshake_overflow_closes() {
        let mut conn = Connection::new(MemStream::default());
        conn.stream.push(vec![b'a'; RECV_BUFFER + 10]);
        conn.on_readable();
        assert!(conn.is_closed());
    }

    #[test]
    fn test_frames_in_same_read_as_handshake() {
        let mut conn = Connection::new(MemStream::default());
        let mut bytes = REQUEST.as_bytes().to_vec();
        bytes.extend(masked(0x1, b"{\"cmd\":\"pause\"}"));
        conn.stream.push(bytes);
        assert_eq!(conn.on_readable(), vec![b"{\"cmd\":\"pause\"}".to_vec()]);
    }

    #[test]
    fn test_concatenated_and_partial_frames() {
        let mut conn = open_connection();
        let mut bytes = masked(0x1, b"one");
        bytes.extend(masked(0x2, b"two"));
        let third = masked(0x1, b"three");
        bytes.extend_from_slice(&third[..4]);
        conn.stream.push(bytes);
        assert_eq!(conn.on_readable(), vec![b"one".to_vec(), b"two".to_vec()]);

        conn.stream.push(&third[4..]);
        assert_eq!(conn.on_readable(), vec![b"three".to_vec()]);
    }

    #[test]
    fn test_close_frame_stops_processing() {
        let mut conn = open_connection();
        let mut bytes = masked(0x1, b"before");
        bytes.extend(masked(0x8, b""));
        bytes.extend(masked(0x1, b"after"));
        conn.stream.push(bytes);
        assert_eq!(conn.on_readable(), vec![b"before".to_vec()]);
        assert!(conn.is_closed());
        assert!(!conn.send("late"));
    }

    #[test]
    fn test_control_and_unknown_opcodes_ignored() {
        let mut conn = open_connection();
        let mut bytes = masked(0x9, b"ping");
        bytes.extend(masked(0x3, b"reserved"));
        bytes.extend(masked(0x1, b"kept"));
        conn.stream.push(bytes);
        assert_eq!(conn.on_readable(), vec![b"kept".to_vec()]);
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[test]
    fn test_oversized_frame_closes() {
        let mut conn = open_connection();
        let frame = masked(0x1, &vec![b'x'; MAX_PAYLOAD + 1]);
        conn.stream.push(frame[..64].to_vec());
        assert!(conn.on_readable().is_empty());
        assert!(conn.is_closed());
    }

    #[test]
    fn test_largest_payload_fits() {
        let mut conn = open_connection();
        let payload = vec![b'y'; MAX_PAYLOAD];
        conn.stream.push(masked(0x2, &payload));
        assert_eq!(conn.on_readable(), vec![payload]);
    }

    #[test]
    fn test_eof_closes() {
        let mut conn = open_connection();
        conn.stream.eof = true;
        conn.on_readable();
        assert!(conn.is_closed());
    }

    #[test]
    fn test_send_writes_unmasked_text_frame() {
        let mut conn = open_connection();
        assert!(conn.send("hi"));
        assert_eq!(conn.stream.written, vec![0x81, 0x02, b'h', b'i']);

        conn.stream.fail_writes = true;
        assert!(!conn.send("again"));
        assert!(conn.is_closed());
    }

    #[test]
    fn test_send_before_open_is_refused() {
        let mut conn = Connection::new(MemStream::default());
        assert!(!conn.send("early"));
        assert_eq!(conn.state(), ConnectionState::Handshaking);
    }

    fn wait_for<T>(mut f: impl FnMut() -> Option<T>) -> T {
        for _ in 0..200 {
            if let Some(v) = f() {
                return v;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not reached");
    }

    fn test_endpoint(max_clients: usize) -> (Endpoint, u16) {
        let config = ServerConfig { port: 0, max_clients, listen_backlog: 8 };
        let endpoint = Endpoint::bind(&config).unwrap();
        let port = endpoint.local_addr().unwrap().port();
        (endpoint, port)
    }

    #[test]
    fn test_endpoint_exchanges_messages() {
        let (mut endpoint, port) = test_endpoint(8);
        let mut client = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        let id = wait_for(|| endpoint.accept().pop());
        client.write_all(REQUEST.as_bytes()).unwrap();
        client.write_all(&masked(0x1, b"hello")).unwrap();

        let mut received = Vec::new();
        wait_for(|| {
            received.extend(endpoint.on_readable(id));
            (!received.is_empty()).then_some(())
        });
        assert_eq!(received, vec![b"hello".to_vec()]);

        let mut head = [0u8; 12];
        client.read_exact(&mut head).unwrap();
        assert_eq!(&head, b"HTTP/1.1 101");
        let mut rest = vec![0u8; upgrade_response(&accept_key("dGhlIHNhbXBsZSBub25jZQ==")).len() - 12];
        client.read_exact(&mut rest).unwrap();

        endpoint.broadcast("hey");
        let mut frame = [0u8; 5];
        client.read_exact(&mut frame).unwrap();
        assert_eq!(frame, [0x81, 0x03, b'h', b'e', b'y']);

        drop(client);
        wait_for(|| {
            endpoint.on_readable(id);
            endpoint.connection(id).is_some_and(Connection::is_closed).then_some(())
        });
        assert_eq!(endpoint.take_closed().len(), 1);
        assert!(endpoint.is_empty());
    }

    #[test]
    fn test_endpoint_enforces_client_cap() {
        let (mut endpoint, port) = test_endpoint(1);
        let _first = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        wait_for(|| endpoint.accept().pop());

        let mut second = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        second.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        wait_for(|| {
            endpoint.accept();
            let mut byte = [0u8; 1];
            matches!(second.read(&mut byte), Ok(0)).then_some(())
        });
        assert_eq!(endpoint.len(), 1);
    }
}
