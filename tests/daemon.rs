use lircd::{
    catalogue::Catalogue,
    daemon::{Daemon, Handle},
    decode::Decode,
    hardware::{HardwareSource, Null, Reception},
    options::Options,
    wire::LineBuffer,
    Error,
};
use pretty_assertions::assert_eq;
use std::{
    fs,
    io::{BufRead, BufReader, ErrorKind, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    os::unix::{
        io::{AsRawFd, RawFd},
        net::UnixStream,
    },
    path::{Path, PathBuf},
    process,
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

const REMOTES: &str = r#"
[[protocols]]
name = "tivo"
protocol = "nec"
[protocols.scancodes]
0x3085f8 = "KEY_MEDIA"
0x3085f0 = "KEY_OK"
"#;

/// Receiver reading `remote button code` lines from a socket
struct LineSource {
    stream: UnixStream,
    inbound: LineBuffer,
}

impl HardwareSource for LineSource {
    fn name(&self) -> &'static str {
        "lines"
    }

    fn device(&self) -> Option<&Path> {
        None
    }

    fn fd(&self) -> Option<RawFd> {
        Some(self.stream.as_raw_fd())
    }

    fn poll(&mut self, _catalogue: &Catalogue) -> std::io::Result<Option<Reception>> {
        loop {
            if let Ok(Some(line)) = self.inbound.next_line() {
                let mut words = line.split_whitespace();

                let decode = match (words.next(), words.next(), words.next()) {
                    (Some(remote), Some(button), Some(code)) => Some(Decode {
                        remote: remote.to_owned(),
                        button: button.to_owned(),
                        code: u64::from_str_radix(code, 16).unwrap(),
                    }),
                    _ => None,
                };

                return Ok(Some(Reception { raw: line, decode }));
            }

            let mut buf = [0u8; 256];

            match self.stream.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(n) => self.inbound.extend(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }
}

struct Fixture {
    dir: PathBuf,
    socket: PathBuf,
    tcp: Option<SocketAddr>,
    handle: Handle,
    hardware: Option<UnixStream>,
    thread: Option<JoinHandle<Result<(), Error>>>,
}

static FIXTURES: AtomicUsize = AtomicUsize::new(0);

fn scratch_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "lircd-test-{}-{}",
        process::id(),
        FIXTURES.fetch_add(1, Ordering::SeqCst)
    ));

    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("remotes.toml"), REMOTES).unwrap();

    dir
}

fn options(dir: &Path) -> Options {
    Options {
        output: dir.join("lircd"),
        config: dir.join("remotes.toml"),
        repeat_timeout: Duration::from_millis(100),
        ..Options::default()
    }
}

/// Run a daemon in a thread; with `hardware` the test can feed it buttons
fn start(hardware: bool, configure: impl FnOnce(&mut Options)) -> Fixture {
    let dir = scratch_dir();
    let mut options = options(&dir);

    configure(&mut options);

    let (ours, theirs) = if hardware {
        let (ours, theirs) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        (Some(ours), Some(theirs))
    } else {
        (None, None)
    };

    let (tx, rx) = mpsc::channel();

    let thread = thread::spawn(move || {
        let source: Box<dyn HardwareSource> = match ours {
            Some(stream) => Box::new(LineSource {
                stream,
                inbound: LineBuffer::default(),
            }),
            None => Box::new(Null),
        };

        let daemon = Daemon::new(&options, source)?;

        tx.send((
            daemon.handle(),
            daemon.socket_path().to_path_buf(),
            daemon.tcp_addr(),
        ))
        .unwrap();

        daemon.run()
    });

    let (handle, socket, tcp) = rx.recv().unwrap();

    Fixture {
        dir,
        socket,
        tcp,
        handle,
        hardware: theirs,
        thread: Some(thread),
    }
}

impl Fixture {
    fn client(&self) -> Client<UnixStream> {
        let stream = UnixStream::connect(&self.socket).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let mut client = Client {
            reader: BufReader::new(stream.try_clone().unwrap()),
            writer: stream,
        };

        // once this is answered the daemon knows about us
        client.command("VERSION");

        client
    }

    fn press(&mut self, line: &str) {
        let hardware = self.hardware.as_mut().unwrap();

        hardware.write_all(line.as_bytes()).unwrap();
        hardware.write_all(b"\n").unwrap();
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.handle.shutdown();

        if let Some(thread) = self.thread.take() {
            let result = thread.join().unwrap();

            if !thread::panicking() {
                result.unwrap();
            }
        }

        let _ = fs::remove_dir_all(&self.dir);
    }
}

struct Client<S: Read + Write> {
    reader: BufReader<S>,
    writer: S,
}

impl<S: Read + Write> Client<S> {
    fn line(&mut self) -> String {
        let mut line = String::new();

        self.reader.read_line(&mut line).unwrap();

        assert!(line.ends_with('\n'), "incomplete line: {line:?}");

        line.pop();
        line
    }

    /// Read a reply envelope, returning its lines without BEGIN and END
    fn reply(&mut self) -> Vec<String> {
        assert_eq!(self.line(), "BEGIN");

        let mut lines = Vec::new();

        loop {
            let line = self.line();

            if line == "END" {
                return lines;
            }

            lines.push(line);
        }
    }

    fn command(&mut self, command: &str) -> Vec<String> {
        self.writer.write_all(command.as_bytes()).unwrap();
        self.writer.write_all(b"\n").unwrap();

        self.reply()
    }
}

#[test]
fn list_remotes_and_buttons() {
    let daemon = start(true, |_| ());
    let mut client = daemon.client();

    assert_eq!(client.command("LIST"), ["LIST", "SUCCESS", "DATA", "1", "tivo"]);
    assert_eq!(
        client.command("LIST tivo"),
        [
            "LIST tivo",
            "SUCCESS",
            "DATA",
            "2",
            "00000000003085f0 KEY_OK",
            "00000000003085f8 KEY_MEDIA"
        ]
    );
    assert_eq!(client.command("FOO"), ["FOO", "ERROR"]);
    assert_eq!(
        client.command("LIST sony"),
        ["LIST sony", "ERROR", "DATA", "1", "unknown remote: \"sony\""]
    );
}

#[test]
fn every_client_gets_every_button() {
    let mut daemon = start(true, |_| ());

    let mut first = daemon.client();
    let mut second = daemon.client();

    daemon.press("tivo KEY_OK 3085f0");

    assert_eq!(first.line(), "00000000003085f0 00 KEY_OK tivo");
    assert_eq!(second.line(), "00000000003085f0 00 KEY_OK tivo");

    // nothing more arrives, so the button is released
    assert_eq!(first.line(), "00000000003085f0 00 KEY_OK_UP tivo");
    assert_eq!(second.line(), "00000000003085f0 00 KEY_OK_UP tivo");

    // another button releases the one held
    daemon.press("tivo KEY_OK 3085f0");
    daemon.press("tivo KEY_OK 3085f0");
    daemon.press("tivo KEY_MEDIA 3085f8");

    for line in [
        "00000000003085f0 00 KEY_OK tivo",
        "00000000003085f0 01 KEY_OK tivo",
        "00000000003085f0 01 KEY_OK_UP tivo",
        "00000000003085f8 00 KEY_MEDIA tivo",
        "00000000003085f8 00 KEY_MEDIA_UP tivo",
    ] {
        assert_eq!(first.line(), line);
        assert_eq!(second.line(), line);
    }
}

#[test]
fn simulate() {
    let daemon = start(true, |o| o.allow_simulate = true);

    let mut simulator = daemon.client();
    let mut listener = daemon.client();

    let command = "SIMULATE 00000000003085f8 00 KEY_MEDIA tivo";

    simulator
        .writer
        .write_all(format!("{command}\n").as_bytes())
        .unwrap();

    // the broadcast comes before the reply
    assert_eq!(simulator.line(), "00000000003085f8 00 KEY_MEDIA tivo");
    assert_eq!(simulator.reply(), [command, "SUCCESS"]);
    assert_eq!(listener.line(), "00000000003085f8 00 KEY_MEDIA tivo");
}

#[test]
fn simulate_disabled() {
    let daemon = start(true, |_| ());

    let mut client = daemon.client();

    assert_eq!(
        client.command("SIMULATE 00000000003085f8 00 KEY_MEDIA tivo"),
        [
            "SIMULATE 00000000003085f8 00 KEY_MEDIA tivo",
            "ERROR",
            "DATA",
            "1",
            "SIMULATE command is disabled"
        ]
    );
}

#[test]
fn oversized_line_closes_connection() {
    let daemon = start(true, |_| ());

    let mut client = daemon.client();

    client.writer.write_all(&[b'A'; 300]).unwrap();

    let mut buf = [0u8; 16];

    match client.reader.read(&mut buf) {
        Ok(n) => assert_eq!(n, 0),
        Err(e) => assert_eq!(e.kind(), ErrorKind::ConnectionReset),
    }

    // others are still served
    let mut other = daemon.client();
    assert_eq!(other.command("LIST")[1], "SUCCESS");
}

#[test]
fn reload() {
    let daemon = start(true, |_| ());

    let mut client = daemon.client();

    fs::write(
        daemon.dir.join("remotes.toml"),
        format!("{REMOTES}\n[[protocols]]\nname = \"mce\"\nprotocol = \"rc6\"\n"),
    )
    .unwrap();

    daemon.handle.reload();

    assert_eq!(client.reply(), ["SIGHUP"]);
    assert_eq!(
        client.command("LIST"),
        ["LIST", "SUCCESS", "DATA", "2", "tivo", "mce"]
    );

    // a broken file keeps the old remotes
    fs::write(daemon.dir.join("remotes.toml"), "protocols = 1").unwrap();

    daemon.handle.reload();

    assert_eq!(client.reply(), ["SIGHUP"]);
    assert_eq!(client.command("LIST")[3], "2");
}

#[test]
fn tcp_clients() {
    let daemon = start(true, |o| o.listen = Some("127.0.0.1:0".parse().unwrap()));

    let stream = TcpStream::connect(daemon.tcp.unwrap()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let mut client = Client {
        reader: BufReader::new(stream.try_clone().unwrap()),
        writer: stream,
    };

    assert_eq!(
        client.command("VERSION"),
        ["VERSION", "SUCCESS", "DATA", "1", env!("CARGO_PKG_VERSION")]
    );
}

#[test]
fn relay_from_peer() {
    let peer = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = peer.local_addr().unwrap().port();

    let daemon = start(false, |o| o.connect = vec![("127.0.0.1".into(), port)]);

    let (mut conn, _) = peer.accept().unwrap();

    let mut client = daemon.client();

    conn.write_all(b"00000000003085f0 00 KEY_OK tivo\n00000000003085f0 00 KEY_OK_UP tivo\n")
        .unwrap();

    assert_eq!(client.line(), "00000000003085f0 00 KEY_OK tivo");
    assert_eq!(client.line(), "00000000003085f0 00 KEY_OK_UP tivo");
}

#[test]
fn peer_releases_keep_startup_suffix() {
    let peer = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = peer.local_addr().unwrap().port();

    let daemon = start(false, |o| o.connect = vec![("127.0.0.1".into(), port)]);

    let (mut conn, _) = peer.accept().unwrap();

    let mut client = daemon.client();

    assert_eq!(
        client.command("RELEASE_SUFFIX _REL"),
        ["RELEASE_SUFFIX _REL", "SUCCESS"]
    );

    // the peer still marks its releases with _UP
    conn.write_all(b"00000000003085f0 00 KEY_OK tivo\n00000000003085f0 00 KEY_OK_UP tivo\n")
        .unwrap();

    assert_eq!(client.line(), "00000000003085f0 00 KEY_OK tivo");
    assert_eq!(client.line(), "00000000003085f0 00 KEY_OK_REL tivo");
}

#[test]
fn unreachable_peer() {
    let port = TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    let daemon = start(false, |o| o.connect = vec![("127.0.0.1".into(), port)]);

    let mut client = daemon.client();

    assert_eq!(client.command("LIST")[1], "SUCCESS");
}

#[test]
fn no_input() {
    let dir = scratch_dir();

    assert!(matches!(
        Daemon::new(&options(&dir), Box::new(Null)),
        Err(Error::NoInput)
    ));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn stale_socket_replaced() {
    let dir = scratch_dir();
    let socket = dir.join("lircd");

    fs::write(&socket, "stale").unwrap();

    let (ours, _theirs) = UnixStream::pair().unwrap();
    ours.set_nonblocking(true).unwrap();

    let daemon = Daemon::new(
        &options(&dir),
        Box::new(LineSource {
            stream: ours,
            inbound: LineBuffer::default(),
        }),
    )
    .unwrap();

    UnixStream::connect(&socket).unwrap();

    drop(daemon);

    assert!(!socket.exists());

    let _ = fs::remove_dir_all(&dir);
}
