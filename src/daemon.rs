//! The event loop: waits on the hardware, the listening sockets, every client
//! and every peer, and moves button presses from the first and last to the
//! clients

use crate::{
    catalogue::Catalogue,
    client::ClientRegistry,
    commands::{self, Context},
    decode::{Decode, DecodeState, DecodedEvent},
    error::Error,
    hardware::HardwareSource,
    listener::Listener,
    options::Options,
    peer::{Backoff, PeerManager},
    pidfile::PidFile,
    wire::{format_event, parse_event, SIGHUP_MESSAGE},
};
use log::{debug, error, info, trace, warn};
use mio::{unix::SourceFd, Events, Interest, Poll, Token, Waker};
use nix::sys::resource::{getrlimit, Resource};
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
use signal_hook_mio::v0_8::Signals;
use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

const HARDWARE: Token = Token(0);
const SIGNALS: Token = Token(1);
const WAKER: Token = Token(2);
const UNIX_LISTENER: Token = Token(3);
const TCP_LISTENER: Token = Token(4);
const PEER_BASE: usize = 16;
const CLIENT_BASE: usize = 1024;

/// Never use more descriptors than this, whatever the limit says
const MAX_DESCRIPTORS: usize = 1024;

/// Descriptors not available for clients or peers: the hardware device,
/// listening sockets, the poll instance, signal pipe, waker and log
const RESERVED_DESCRIPTORS: usize = 6;

/// Number of clients and peers which can be served at the same time, each
pub fn connection_limit() -> usize {
    let budget = match getrlimit(Resource::RLIMIT_NOFILE) {
        Ok((soft, _)) => usize::try_from(soft)
            .unwrap_or(MAX_DESCRIPTORS)
            .min(MAX_DESCRIPTORS),
        Err(e) => {
            warn!("cannot get descriptor limit: {e}");
            MAX_DESCRIPTORS
        }
    };

    budget.saturating_sub(RESERVED_DESCRIPTORS) / 2
}

/// Stops or reloads a running daemon from another thread
#[derive(Clone)]
pub struct Handle {
    shutdown: Arc<AtomicBool>,
    reload: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl Handle {
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake();
    }

    /// Re-read the remotes, as on SIGHUP
    pub fn reload(&self) {
        self.reload.store(true, Ordering::SeqCst);
        self.wake();
    }

    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            warn!("cannot wake event loop: {e}");
        }
    }
}

pub struct Daemon {
    poll: Poll,
    hardware: Box<dyn HardwareSource>,
    catalogue: Catalogue,
    config: PathBuf,
    decode: DecodeState,
    release_suffix: String,
    /// Suffix peers mark releases with, which clients cannot change
    peer_release_suffix: String,
    allow_simulate: bool,
    listener: Listener,
    clients: ClientRegistry,
    peers: PeerManager,
    signals: Option<Signals>,
    shutdown: Arc<AtomicBool>,
    reload: Arc<AtomicBool>,
    waker: Arc<Waker>,
    _pidfile: Option<PidFile>,
}

impl Daemon {
    /// Set up everything: read the remotes, create the sockets and register
    /// the hardware. Fails if there would be nothing to listen to.
    pub fn new(options: &Options, hardware: Box<dyn HardwareSource>) -> Result<Daemon, Error> {
        let hardware_fd = hardware.fd();

        if hardware_fd.is_none() && options.connect.is_empty() {
            return Err(Error::NoInput);
        }

        let limit = connection_limit();

        if options.connect.len() > limit {
            return Err(Error::TooManyPeers(limit));
        }

        let catalogue = Catalogue::load(&options.config)?;

        let peers = PeerManager::new(&options.connect, PEER_BASE, Backoff::default())?;

        if catalogue.is_empty() {
            warn!("{}: no remotes defined", options.config.display());
        }

        let poll = Poll::new().map_err(|e| Error::io("cannot create poll", e))?;
        let registry = poll.registry();

        if let Some(fd) = hardware_fd {
            registry
                .register(&mut SourceFd(&fd), HARDWARE, Interest::READABLE)
                .map_err(|e| Error::io(format!("cannot poll {} device", hardware.name()), e))?;
        }

        let mut listener = Listener::bind(&options.output, options.permission, options.listen)?;

        listener
            .register(registry, UNIX_LISTENER, TCP_LISTENER)
            .map_err(|e| Error::io("cannot poll listening socket", e))?;

        let waker = Waker::new(registry, WAKER).map_err(|e| Error::io("cannot create waker", e))?;

        let pidfile = match &options.pidfile {
            Some(path) => Some(PidFile::create(path)?),
            None => None,
        };

        match hardware.device() {
            Some(device) => info!(
                "lircd({}) ready, reading {}, using {}",
                hardware.name(),
                device.display(),
                listener.path().display()
            ),
            None => info!(
                "lircd({}) ready, using {}",
                hardware.name(),
                listener.path().display()
            ),
        }

        Ok(Daemon {
            poll,
            hardware,
            catalogue,
            config: options.config.clone(),
            decode: DecodeState::new(options.repeat_max, options.repeat_timeout),
            release_suffix: options.release_suffix.clone(),
            peer_release_suffix: options.release_suffix.clone(),
            allow_simulate: options.allow_simulate,
            listener,
            clients: ClientRegistry::new(CLIENT_BASE, limit),
            peers,
            signals: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            reload: Arc::new(AtomicBool::new(false)),
            waker: Arc::new(waker),
            _pidfile: pidfile,
        })
    }

    /// Reload on SIGHUP, exit cleanly on SIGTERM or SIGINT
    pub fn handle_signals(&mut self) -> Result<(), Error> {
        let mut signals = Signals::new([SIGHUP, SIGINT, SIGTERM])
            .map_err(|e| Error::io("cannot install signal handlers", e))?;

        self.poll
            .registry()
            .register(&mut signals, SIGNALS, Interest::READABLE)
            .map_err(|e| Error::io("cannot poll signals", e))?;

        self.signals = Some(signals);

        Ok(())
    }

    pub fn handle(&self) -> Handle {
        Handle {
            shutdown: self.shutdown.clone(),
            reload: self.reload.clone(),
            waker: self.waker.clone(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        self.listener.path()
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.listener.tcp_addr()
    }

    pub fn run(mut self) -> Result<(), Error> {
        let mut events = Events::with_capacity(256);

        self.peers.connect_all(self.poll.registry(), Instant::now());

        while !self.shutdown.load(Ordering::SeqCst) {
            let timeout = self
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()));

            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }

                return Err(Error::io("poll failed", e));
            }

            let now = Instant::now();

            for event in &events {
                let readable = event.is_readable() || event.is_read_closed() || event.is_error();

                match event.token() {
                    HARDWARE => self.hardware_ready(now),
                    SIGNALS => self.signals_ready(),
                    WAKER => (),
                    UNIX_LISTENER => self.accept(false),
                    TCP_LISTENER => self.accept(true),
                    token if self.peers.owns(token) => {
                        let lines = self.peers.ready(self.poll.registry(), token, readable, now);

                        for line in lines {
                            self.relay(&line, now);
                        }
                    }
                    token => self.client_ready(token, readable, event.is_writable(), now),
                }
            }

            if self.reload.swap(false, Ordering::SeqCst) {
                self.reload_catalogue(now);
            }

            self.housekeeping(Instant::now());
        }

        info!("shutting down");

        self.clients.close_all(self.poll.registry());
        self.peers.close_all(self.poll.registry());

        Ok(())
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.decode.next_deadline(),
            self.peers.next_deadline(),
            self.clients.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn housekeeping(&mut self, now: Instant) {
        if let Some(release) = self.decode.expire(now) {
            self.broadcast(vec![release], now);
        }

        self.peers.tick(self.poll.registry(), now);
        self.clients.sweep(self.poll.registry(), now);
    }

    fn signals_ready(&mut self) {
        let Some(signals) = &mut self.signals else {
            return;
        };

        for signal in signals.pending() {
            match signal {
                SIGHUP => self.reload.store(true, Ordering::SeqCst),
                signal => {
                    info!("caught signal {signal}");
                    self.shutdown.store(true, Ordering::SeqCst);
                }
            }
        }
    }

    fn reload_catalogue(&mut self, now: Instant) {
        info!("re-reading {}", self.config.display());

        match Catalogue::load(&self.config) {
            Ok(catalogue) => self.catalogue = catalogue,
            Err(e) => error!("{e}, keeping the old remotes"),
        }

        self.clients
            .broadcast(self.poll.registry(), SIGHUP_MESSAGE, now);
    }

    fn hardware_ready(&mut self, now: Instant) {
        loop {
            match self.hardware.poll(&self.catalogue) {
                Ok(Some(reception)) => {
                    trace!("{}: {}", self.hardware.name(), reception.raw);

                    let Some(decode) = reception.decode else {
                        continue;
                    };

                    if let Err(e) = self.hardware.notify_decoded() {
                        warn!("{}: notify decode failed: {e}", self.hardware.name());
                    }

                    self.inject(decode, now);
                }
                Ok(None) => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => (),
                Err(e) => {
                    error!("{}: read failed: {e}", self.hardware.name());
                    break;
                }
            }
        }
    }

    fn inject(&mut self, decode: Decode, now: Instant) {
        let timeout = self
            .catalogue
            .find(&decode.remote)
            .and_then(|r| r.repeat_timeout);

        let events = self.decode.decode(decode, timeout, now);

        self.broadcast(events, now);
    }

    /// A line a peer broadcast, which we pass on as our own
    fn relay(&mut self, line: &str, now: Instant) {
        let event = match parse_event(line, &self.peer_release_suffix) {
            Ok(event) => event,
            Err(e) => {
                warn!("peer: {e}");
                return;
            }
        };

        if event.release {
            if let Some(release) = self.decode.release(event.remote, event.button) {
                self.broadcast(vec![release], now);
            }
            return;
        }

        let decode = Decode {
            remote: event.remote.to_owned(),
            button: event.button.to_owned(),
            code: event.code,
        };

        self.inject(decode, now);
    }

    fn broadcast(&mut self, events: Vec<DecodedEvent>, now: Instant) {
        for event in events {
            let line = format_event(&event, &self.release_suffix);

            debug!("broadcasting: {}", line.trim_end());

            self.clients.broadcast(self.poll.registry(), &line, now);
        }
    }

    fn accept(&mut self, tcp: bool) {
        loop {
            let accepted = if tcp {
                self.listener.accept_tcp()
            } else {
                self.listener.accept_unix()
            };

            match accepted {
                Ok(Some(stream)) => {
                    if let Err(e) = self.clients.register(
                        self.poll.registry(),
                        stream,
                        self.allow_simulate,
                    ) {
                        warn!("cannot register client: {e}");
                    }
                }
                Ok(None) => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => (),
                Err(e) => {
                    warn!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn client_ready(&mut self, token: Token, readable: bool, writable: bool, now: Instant) {
        if writable {
            self.clients.writable(self.poll.registry(), token, now);
        }

        if !readable {
            return;
        }

        let Some(input) = self.clients.read(token) else {
            return;
        };

        let allow_simulate = self
            .clients
            .get(token)
            .is_some_and(|client| client.allow_simulate);

        for line in &input.lines {
            let mut ctx = Context {
                catalogue: &self.catalogue,
                decode: &mut self.decode,
                release_suffix: &mut self.release_suffix,
                now,
                events: Vec::new(),
            };

            let reply = commands::dispatch(&mut ctx, line, allow_simulate);
            let events = ctx.events;

            self.broadcast(events, now);
            self.clients.send(self.poll.registry(), token, &reply, now);

            if !self.clients.owns(token) {
                return;
            }
        }

        if input.closed {
            self.clients.remove(self.poll.registry(), token);
        }
    }
}
