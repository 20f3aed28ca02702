//! Connected clients: their sockets, input framing and output queues

use crate::wire::{FramingError, LineBuffer};
use log::{debug, info, warn};
use mio::{
    event::Source,
    net::{TcpStream, UnixStream},
    Interest, Registry, Token,
};
use std::{
    collections::HashMap,
    io::{self, ErrorKind, Read, Write},
    time::{Duration, Instant},
};

/// Output which may be queued for a client before it is dropped
pub const MAX_OUTBOUND: usize = 64 * 1024;

/// How long a client may refuse to take output before it is dropped
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Either kind of connection a client can make
pub enum Stream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Stream {
    pub fn describe(&self) -> String {
        match self {
            Stream::Unix(_) => String::from("local socket"),
            Stream::Tcp(s) => match s.peer_addr() {
                Ok(addr) => format!("{addr}"),
                Err(_) => String::from("tcp socket"),
            },
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Unix(s) => s.read(buf),
            Stream::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Unix(s) => s.write(buf),
            Stream::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Unix(s) => s.flush(),
            Stream::Tcp(s) => s.flush(),
        }
    }
}

impl Source for Stream {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Stream::Unix(s) => s.register(registry, token, interests),
            Stream::Tcp(s) => s.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Stream::Unix(s) => s.reregister(registry, token, interests),
            Stream::Tcp(s) => s.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Stream::Unix(s) => s.deregister(registry),
            Stream::Tcp(s) => s.deregister(registry),
        }
    }
}

pub struct Client {
    stream: Stream,
    token: Token,
    name: String,
    inbound: LineBuffer,
    outbound: Vec<u8>,
    /// Set while output is waiting for the socket to become writable
    blocked_since: Option<Instant>,
    writable_interest: bool,
    pub allow_simulate: bool,
}

/// What a read from a client produced
#[derive(Debug, PartialEq, Eq)]
pub struct Input {
    /// Complete command lines, in the order they arrived
    pub lines: Vec<String>,
    /// The client has gone or broke framing, and must be removed once the
    /// lines have been handled
    pub closed: bool,
}

impl Client {
    /// Read everything available, since the socket is registered edge triggered
    fn read(&mut self) -> Input {
        let mut input = Input {
            lines: Vec::new(),
            closed: false,
        };
        let mut buf = [0u8; 1024];

        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    debug!("{}: closed connection", self.name);
                    input.closed = true;
                    break;
                }
                Ok(n) => self.inbound.extend(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => (),
                Err(e) => {
                    info!("{}: read failed: {e}", self.name);
                    input.closed = true;
                    break;
                }
            }
        }

        loop {
            match self.inbound.next_line() {
                Ok(Some(line)) => {
                    if !line.trim().is_empty() {
                        input.lines.push(line);
                    }
                }
                Ok(None) => break,
                Err(FramingError::TooLong) => {
                    warn!("{}: command too long, closing connection", self.name);
                    input.closed = true;
                    break;
                }
                Err(FramingError::Garbled) => {
                    warn!("{}: garbled command, closing connection", self.name);
                    input.closed = true;
                    break;
                }
            }
        }

        if input.closed {
            self.inbound.clear();
        }

        input
    }

    fn queue(&mut self, data: &[u8]) -> io::Result<()> {
        if self.outbound.len() + data.len() > MAX_OUTBOUND {
            return Err(io::Error::new(
                ErrorKind::Other,
                "client is not reading its output",
            ));
        }

        self.outbound.extend_from_slice(data);

        Ok(())
    }

    /// Write as much queued output as the socket takes without blocking, and
    /// only ask for writable events while something is left over
    fn flush(&mut self, registry: &Registry, now: Instant) -> io::Result<()> {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.outbound.drain(..n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => (),
                Err(e) => return Err(e),
            }
        }

        let want_write = !self.outbound.is_empty();

        if want_write {
            self.blocked_since.get_or_insert(now);
        } else {
            self.blocked_since = None;
        }

        if want_write != self.writable_interest {
            let interest = if want_write {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };

            self.stream.reregister(registry, self.token, interest)?;
            self.writable_interest = want_write;
        }

        Ok(())
    }

    fn send(&mut self, registry: &Registry, data: &[u8], now: Instant) -> io::Result<()> {
        self.queue(data)?;
        self.flush(registry, now)
    }
}

/// All live client connections, keyed by their token
pub struct ClientRegistry {
    clients: HashMap<Token, Client>,
    first_token: usize,
    next_token: usize,
    max_clients: usize,
}

impl ClientRegistry {
    pub fn new(first_token: usize, max_clients: usize) -> Self {
        ClientRegistry {
            clients: HashMap::new(),
            first_token,
            next_token: first_token,
            max_clients,
        }
    }

    pub fn owns(&self, token: Token) -> bool {
        self.clients.contains_key(&token)
    }

    pub fn get(&self, token: Token) -> Option<&Client> {
        self.clients.get(&token)
    }

    /// Register a newly accepted connection. The connection is refused, by
    /// closing it, when there are already too many clients.
    pub fn register(
        &mut self,
        registry: &Registry,
        mut stream: Stream,
        allow_simulate: bool,
    ) -> io::Result<Option<Token>> {
        let name = stream.describe();

        if self.clients.len() >= self.max_clients {
            warn!(
                "{name}: connection rejected, already serving {} clients",
                self.clients.len()
            );
            return Ok(None);
        }

        let token = self.allocate_token();

        stream.register(registry, token, Interest::READABLE)?;

        info!("accepted new client from {name}");

        self.clients.insert(
            token,
            Client {
                stream,
                token,
                name,
                inbound: LineBuffer::default(),
                outbound: Vec::new(),
                blocked_since: None,
                writable_interest: false,
                allow_simulate,
            },
        );

        Ok(Some(token))
    }

    fn allocate_token(&mut self) -> Token {
        loop {
            let token = Token(self.next_token);

            self.next_token = self.next_token.checked_add(1).unwrap_or(self.first_token);

            if !self.clients.contains_key(&token) {
                return token;
            }
        }
    }

    pub fn read(&mut self, token: Token) -> Option<Input> {
        self.clients.get_mut(&token).map(|c| c.read())
    }

    /// Socket became writable again
    pub fn writable(&mut self, registry: &Registry, token: Token, now: Instant) {
        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };

        if let Err(e) = client.flush(registry, now) {
            info!("{}: write failed: {e}", client.name);
            self.remove(registry, token);
        }
    }

    /// Send to one client, which is removed if that fails
    pub fn send(&mut self, registry: &Registry, token: Token, data: &str, now: Instant) {
        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };

        if let Err(e) = client.send(registry, data.as_bytes(), now) {
            info!("{}: write failed: {e}", client.name);
            self.remove(registry, token);
        }
    }

    /// Send to every client exactly once. Clients that cannot take it are
    /// removed, the others still get it.
    pub fn broadcast(&mut self, registry: &Registry, data: &str, now: Instant) {
        let mut failed = Vec::new();

        for (token, client) in self.clients.iter_mut() {
            if let Err(e) = client.send(registry, data.as_bytes(), now) {
                info!("{}: write failed: {e}", client.name);
                failed.push(*token);
            }
        }

        for token in failed {
            self.remove(registry, token);
        }
    }

    /// Earliest moment a blocked client will be dropped
    pub fn next_deadline(&self) -> Option<Instant> {
        self.clients
            .values()
            .filter_map(|c| c.blocked_since)
            .min()
            .map(|since| since + WRITE_TIMEOUT)
    }

    /// Drop clients which have not taken their output for too long
    pub fn sweep(&mut self, registry: &Registry, now: Instant) {
        let hung = self
            .clients
            .values()
            .filter(|c| c.blocked_since.is_some_and(|since| now >= since + WRITE_TIMEOUT))
            .map(|c| c.token)
            .collect::<Vec<_>>();

        for token in hung {
            if let Some(client) = self.clients.get(&token) {
                warn!("{}: not reading, dropping client", client.name);
            }
            self.remove(registry, token);
        }
    }

    pub fn remove(&mut self, registry: &Registry, token: Token) {
        if let Some(mut client) = self.clients.remove(&token) {
            if let Err(e) = client.stream.deregister(registry) {
                debug!("{}: deregister failed: {e}", client.name);
            }

            info!("removed client {}", client.name);
        }
    }

    /// Best effort flush of pending output, then close everything
    pub fn close_all(&mut self, registry: &Registry) {
        let now = Instant::now();

        for (_, mut client) in self.clients.drain() {
            let _ = client.flush(registry, now);
            let _ = client.stream.deregister(registry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Events, Poll};
    use std::os::unix::net;

    fn pair() -> (Stream, net::UnixStream) {
        let (ours, theirs) = net::UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();

        (Stream::Unix(UnixStream::from_std(ours)), theirs)
    }

    #[test]
    fn lines_in_order_and_bounded() {
        let poll = Poll::new().unwrap();
        let mut clients = ClientRegistry::new(100, 1);

        let (stream, mut remote) = pair();
        let token = clients
            .register(poll.registry(), stream, false)
            .unwrap()
            .unwrap();

        assert_eq!(token, Token(100));

        let (stream, _remote2) = pair();
        assert_eq!(
            clients.register(poll.registry(), stream, false).unwrap(),
            None
        );

        remote.write_all(b"LIST\n\nVERSION\nLI").unwrap();

        assert_eq!(
            clients.read(token),
            Some(Input {
                lines: vec!["LIST".into(), "VERSION".into()],
                closed: false
            })
        );

        remote.write_all(b"ST tivo\n").unwrap();
        drop(remote);

        assert_eq!(
            clients.read(token),
            Some(Input {
                lines: vec!["LIST tivo".into()],
                closed: true
            })
        );

        clients.remove(poll.registry(), token);
        assert!(!clients.owns(token));
    }

    #[test]
    fn oversized_line_closes() {
        let poll = Poll::new().unwrap();
        let mut clients = ClientRegistry::new(100, 10);

        let (stream, mut remote) = pair();
        let token = clients
            .register(poll.registry(), stream, false)
            .unwrap()
            .unwrap();

        remote.write_all(&[b'A'; 300]).unwrap();

        let input = clients.read(token).unwrap();
        assert!(input.closed);
        assert!(input.lines.is_empty());
    }

    #[test]
    fn short_writes_resume_when_writable() {
        let mut poll = Poll::new().unwrap();
        let mut events = Events::with_capacity(4);
        let now = Instant::now();
        let mut clients = ClientRegistry::new(100, 10);

        let (stream, mut remote) = pair();
        let token = clients
            .register(poll.registry(), stream, false)
            .unwrap()
            .unwrap();

        // queue output until the socket stops taking it
        let mut expected = Vec::new();
        for n in 0..1000 {
            if clients.next_deadline().is_some() {
                break;
            }
            let chunk = char::from(b'a' + (n % 26) as u8).to_string().repeat(1000);
            clients.broadcast(poll.registry(), &chunk, now);
            expected.extend_from_slice(chunk.as_bytes());
        }

        assert!(clients.owns(token));
        assert_eq!(clients.next_deadline(), Some(now + WRITE_TIMEOUT));

        remote
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();

        let mut received = Vec::new();
        let mut buf = [0u8; 8192];

        for _ in 0..1000 {
            if received.len() == expected.len() {
                break;
            }

            match remote.read(&mut buf) {
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => (),
                Err(e) => panic!("{e}"),
            }

            poll.poll(&mut events, Some(Duration::from_millis(10)))
                .unwrap();

            for event in &events {
                if event.is_writable() {
                    clients.writable(poll.registry(), event.token(), now);
                }
            }
        }

        assert!(received == expected, "output lost or reordered");
        assert_eq!(clients.next_deadline(), None);
        assert!(clients.owns(token));
    }

    #[test]
    fn slow_reader_is_dropped() {
        let mut poll = Poll::new().unwrap();
        let mut events = Events::with_capacity(4);
        let now = Instant::now();
        let mut clients = ClientRegistry::new(100, 10);

        let (stream, _remote) = pair();
        let token = clients
            .register(poll.registry(), stream, false)
            .unwrap()
            .unwrap();

        // fill the socket buffer, nobody is reading on the other side
        let chunk = "x".repeat(4096);
        for _ in 0..1000 {
            if !clients.owns(token) || clients.next_deadline().is_some() {
                break;
            }
            clients.broadcast(poll.registry(), &chunk, now);
        }

        let _ = poll.poll(&mut events, Some(Duration::from_millis(1)));

        if clients.owns(token) {
            assert_eq!(clients.next_deadline(), Some(now + WRITE_TIMEOUT));

            clients.sweep(poll.registry(), now + WRITE_TIMEOUT);
        }

        assert!(!clients.owns(token));
    }
}
