//! Connections to other lircd instances, whose broadcasts are relayed to our
//! clients as if our own hardware had decoded them

use crate::{error::Error, wire::LineBuffer};
use log::{debug, info, warn};
use mio::{net::TcpStream, Interest, Registry, Token};
use std::{
    fmt,
    io::{self, ErrorKind, Read},
    net::{SocketAddr, ToSocketAddrs},
    time::{Duration, Instant},
};

/// Port lircd listens on by default
pub const LIRC_INET_PORT: u16 = 8765;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Connecting,
    Connected,
}

/// Reconnect delays: doubling from `min` with every consecutive failure, up to `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub min: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            min: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

impl Backoff {
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);

        self.min
            .checked_mul(1 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// Parse `host[:port]`
pub fn parse_peer(arg: &str) -> Result<(String, u16), Error> {
    match arg.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .ok()
                .filter(|p| *p > 0)
                .ok_or_else(|| Error::BadPort(port.to_owned()))?;

            if host.is_empty() {
                return Err(Error::BadAddress(arg.to_owned()));
            }

            Ok((host.to_owned(), port))
        }
        None if arg.is_empty() => Err(Error::BadAddress(arg.to_owned())),
        None => Ok((arg.to_owned(), LIRC_INET_PORT)),
    }
}

pub struct Peer {
    host: String,
    port: u16,
    /// Resolved once at startup, so connecting never waits for a name lookup
    addr: SocketAddr,
    stream: Option<TcpStream>,
    state: PeerState,
    reconnect: Instant,
    failures: u32,
    inbound: LineBuffer,
    /// Inside a BEGIN/END reply block, which is not an event
    in_reply: bool,
}

impl Peer {
    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// When the next connection attempt is due, while disconnected
    pub fn reconnect_at(&self) -> Option<Instant> {
        (self.state == PeerState::Disconnected).then_some(self.reconnect)
    }

    fn lines(&mut self, out: &mut Vec<String>) -> io::Result<()> {
        loop {
            let line = match self.inbound.next_line() {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(()),
                Err(_) => {
                    return Err(io::Error::new(
                        ErrorKind::InvalidData,
                        "cannot make sense of data",
                    ))
                }
            };

            if self.in_reply {
                if line == "END" {
                    self.in_reply = false;
                }
            } else if line == "BEGIN" {
                self.in_reply = true;
            } else if !line.trim().is_empty() {
                out.push(line);
            }
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(f, "{}:{}", self.host, self.port)
    }
}

pub struct PeerManager {
    peers: Vec<Peer>,
    first_token: usize,
    backoff: Backoff,
}

impl PeerManager {
    /// Look up every peer address. This may block, so it must happen
    /// before the event loop starts.
    pub fn new(
        addrs: &[(String, u16)],
        first_token: usize,
        backoff: Backoff,
    ) -> Result<Self, Error> {
        let now = Instant::now();

        let peers = addrs
            .iter()
            .map(|(host, port)| {
                let addr = resolve(host, *port)
                    .map_err(|e| Error::io(format!("cannot resolve peer {host}"), e))?;

                debug!("peer {host}:{port} is {addr}");

                Ok(Peer {
                    host: host.clone(),
                    port: *port,
                    addr,
                    stream: None,
                    state: PeerState::Disconnected,
                    reconnect: now,
                    failures: 0,
                    inbound: LineBuffer::default(),
                    in_reply: false,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        Ok(PeerManager {
            peers,
            first_token,
            backoff,
        })
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn owns(&self, token: Token) -> bool {
        token.0 >= self.first_token && token.0 < self.first_token + self.peers.len()
    }

    /// Attempt to connect to every peer
    pub fn connect_all(&mut self, registry: &Registry, now: Instant) {
        for index in 0..self.peers.len() {
            self.connect(registry, index, now);
        }
    }

    /// Retry peers whose reconnect deadline has passed
    pub fn tick(&mut self, registry: &Registry, now: Instant) {
        for index in 0..self.peers.len() {
            let peer = &self.peers[index];

            if peer.state == PeerState::Disconnected && now >= peer.reconnect {
                self.connect(registry, index, now);
            }
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.peers.iter().filter_map(|p| p.reconnect_at()).min()
    }

    fn connect(&mut self, registry: &Registry, index: usize, now: Instant) {
        let token = Token(self.first_token + index);
        let peer = &mut self.peers[index];

        debug!("connecting to {peer} at {}", peer.addr);

        let mut stream = match TcpStream::connect(peer.addr) {
            Ok(stream) => stream,
            Err(e) => {
                self.failed(registry, index, &e, now);
                return;
            }
        };

        if let Err(e) = registry.register(
            &mut stream,
            token,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            self.failed(registry, index, &e, now);
            return;
        }

        peer.stream = Some(stream);
        peer.state = PeerState::Connecting;
        peer.inbound.clear();
        peer.in_reply = false;
    }

    fn failed(&mut self, registry: &Registry, index: usize, err: &dyn fmt::Display, now: Instant) {
        let peer = &mut self.peers[index];

        if let Some(mut stream) = peer.stream.take() {
            let _ = registry.deregister(&mut stream);
        }

        peer.failures = peer.failures.saturating_add(1);
        let delay = self.backoff.delay(peer.failures);
        peer.reconnect = now + delay;
        peer.state = PeerState::Disconnected;

        warn!(
            "could not connect to {peer}: {err}, retrying in {}",
            humantime::format_duration(delay)
        );
    }

    fn lost(&mut self, registry: &Registry, index: usize, reason: &str, now: Instant) {
        let peer = &mut self.peers[index];

        if let Some(mut stream) = peer.stream.take() {
            let _ = registry.deregister(&mut stream);
        }

        // a peer which was connected starts over at the shortest delay
        peer.failures = 1;
        let delay = self.backoff.delay(peer.failures);
        peer.reconnect = now + delay;
        peer.state = PeerState::Disconnected;

        info!(
            "connection to {peer} lost: {reason}, reconnecting in {}",
            humantime::format_duration(delay)
        );
    }

    /// Handle readiness of a peer socket. Returns broadcast lines the peer sent.
    pub fn ready(
        &mut self,
        registry: &Registry,
        token: Token,
        readable: bool,
        now: Instant,
    ) -> Vec<String> {
        let mut lines = Vec::new();

        if !self.owns(token) {
            return lines;
        }

        let index = token.0 - self.first_token;
        let peer = &mut self.peers[index];

        let Some(stream) = &mut peer.stream else {
            return lines;
        };

        if peer.state == PeerState::Connecting {
            match stream.take_error() {
                Ok(Some(e)) | Err(e) => {
                    self.failed(registry, index, &e, now);
                    return lines;
                }
                Ok(None) => (),
            }

            match stream.peer_addr() {
                Ok(_) => {
                    if let Err(e) = registry.reregister(stream, token, Interest::READABLE) {
                        self.failed(registry, index, &e, now);
                        return lines;
                    }

                    info!("connected to {}:{}", peer.host, peer.port);

                    peer.state = PeerState::Connected;
                    peer.failures = 0;
                }
                // still in progress
                Err(e) if e.kind() == ErrorKind::NotConnected => return lines,
                Err(e) => {
                    self.failed(registry, index, &e, now);
                    return lines;
                }
            }
        } else if !readable {
            return lines;
        }

        // read until WouldBlock, since we are edge triggered
        let mut buf = [0u8; 1024];
        let result = loop {
            match stream.read(&mut buf) {
                Ok(0) => break Err(String::from("closed by peer")),
                Ok(n) => peer.inbound.extend(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => (),
                Err(e) => break Err(e.to_string()),
            }
        };

        let result = result.and_then(|_| peer.lines(&mut lines).map_err(|e| e.to_string()));

        if let Err(reason) = result {
            // anything complete before the loss still counts
            let _ = peer.lines(&mut lines);
            self.lost(registry, index, &reason, now);
        }

        lines
    }

    pub fn close_all(&mut self, registry: &Registry) {
        for peer in &mut self.peers {
            if let Some(mut stream) = peer.stream.take() {
                let _ = registry.deregister(&mut stream);
            }
            peer.state = PeerState::Disconnected;
        }
    }
}

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            ErrorKind::NotFound,
            format!("no address found for {host}"),
        )
    })
}
