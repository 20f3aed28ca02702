//! Command line and options file handling. Values given on the command line
//! override the `[lircd]` table of the options file, which overrides the
//! built in defaults.

use crate::{
    decode::{DEFAULT_REPEAT_MAX, DEFAULT_REPEAT_TIMEOUT},
    error::Error,
    hardware,
    peer::{parse_peer, LIRC_INET_PORT},
    wire::RELEASE_SUFFIX,
};
use clap::{ArgAction, Parser};
use log::{debug, warn};
use serde::Deserialize;
use std::{
    fs,
    io::ErrorKind,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_OPTIONS_FILE: &str = "/etc/lirc/lirc_options.toml";
pub const DEFAULT_CONFIG: &str = "/etc/lirc/lircd.conf.d/remotes.toml";
pub const DEFAULT_OUTPUT: &str = "/var/run/lirc/lircd";
pub const DEFAULT_PERMISSION: u32 = 0o666;

#[derive(Parser, Debug, Default)]
#[command(
    name = "lircd",
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = "Decode infrared and broadcast button presses to clients"
)]
pub struct Args {
    /// Increase message verbosity
    #[arg(long, short, action = ArgAction::Count, conflicts_with = "quiet")]
    pub verbose: u8,

    /// Silence all warnings
    #[arg(long, short, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Options file [default: $LIRC_OPTIONS_PATH or /etc/lirc/lirc_options.toml]
    #[arg(long = "options-file", short = 'O')]
    pub options_file: Option<PathBuf>,

    /// File permissions for the output socket, in octal
    #[arg(long, short = 'p')]
    pub permission: Option<String>,

    /// Hardware driver, use "help" for a list
    #[arg(long, short = 'H')]
    pub driver: Option<String>,

    /// Read from given device
    #[arg(long, short = 'd')]
    pub device: Option<PathBuf>,

    /// Listen for network connections on [address:]port
    #[arg(long, short = 'l', num_args = 0..=1, default_missing_value = "8765")]
    pub listen: Option<String>,

    /// Connect to remote lircd server as host[:port]
    #[arg(long, short = 'c')]
    pub connect: Vec<String>,

    /// Output socket filename
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,

    /// Daemon pid file
    #[arg(long = "pidfile", short = 'P')]
    pub pidfile: Option<PathBuf>,

    /// Generate release events with the given suffix
    #[arg(long, short = 'r', num_args = 0..=1, default_missing_value = RELEASE_SUFFIX)]
    pub release: Option<String>,

    /// Accept SIMULATE command
    #[arg(long = "allow-simulate", short = 'a')]
    pub allow_simulate: bool,

    /// Maximum number of repeats of one button press
    #[arg(long = "repeat-max", short = 'R')]
    pub repeat_max: Option<u32>,

    /// Time after which a held button is released, e.g. 200ms
    #[arg(long = "repeat-timeout", short = 't', value_parser = humantime::parse_duration)]
    pub repeat_timeout: Option<Duration>,

    /// Remote definitions, a keymap file or a directory of them
    #[arg(value_name = "CONFIG")]
    pub config: Option<PathBuf>,
}

/// The `[lircd]` table of the options file
#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct FileOptions {
    driver: Option<String>,
    device: Option<PathBuf>,
    output: Option<PathBuf>,
    permission: Option<String>,
    listen: Option<String>,
    #[serde(default)]
    connect: Vec<String>,
    pidfile: Option<PathBuf>,
    allow_simulate: Option<bool>,
    release_suffix: Option<String>,
    repeat_max: Option<u32>,
    repeat_timeout: Option<String>,
    config: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Default)]
struct OptionsFile {
    #[serde(default)]
    lircd: FileOptions,
}

/// Everything the daemon needs to know to start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    pub driver: String,
    pub device: Option<PathBuf>,
    pub output: PathBuf,
    pub permission: u32,
    pub listen: Option<SocketAddr>,
    pub connect: Vec<(String, u16)>,
    pub pidfile: Option<PathBuf>,
    pub allow_simulate: bool,
    pub release_suffix: String,
    pub repeat_max: u32,
    pub repeat_timeout: Duration,
    pub config: PathBuf,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            driver: String::from("null"),
            device: None,
            output: PathBuf::from(DEFAULT_OUTPUT),
            permission: DEFAULT_PERMISSION,
            listen: None,
            connect: Vec::new(),
            pidfile: None,
            allow_simulate: false,
            release_suffix: String::from(RELEASE_SUFFIX),
            repeat_max: DEFAULT_REPEAT_MAX,
            repeat_timeout: DEFAULT_REPEAT_TIMEOUT,
            config: PathBuf::from(DEFAULT_CONFIG),
        }
    }
}

impl Options {
    /// Merge the command line with the options file. Does not resolve the
    /// driver, since "help" has to be handled before that.
    pub fn from_args(args: &Args) -> Result<Options, Error> {
        let (path, explicit) = match &args.options_file {
            Some(path) => (path.clone(), true),
            None => match std::env::var_os("LIRC_OPTIONS_PATH") {
                Some(path) => (PathBuf::from(path), true),
                None => (PathBuf::from(DEFAULT_OPTIONS_FILE), false),
            },
        };

        let file = match fs::read_to_string(&path) {
            Ok(contents) => {
                debug!("reading options from {}", path.display());
                parse_options_file(&contents, &path)?
            }
            Err(e) if e.kind() == ErrorKind::NotFound && !explicit => {
                warn!("{}: not found, using defaults", path.display());
                FileOptions::default()
            }
            Err(e) => return Err(Error::io(path.display().to_string(), e)),
        };

        Options::merge(args, file, &path)
    }

    fn merge(args: &Args, file: FileOptions, path: &Path) -> Result<Options, Error> {
        let defaults = Options::default();

        let permission = match args.permission.as_ref().or(file.permission.as_ref()) {
            Some(mode) => parse_permission(mode)?,
            None => defaults.permission,
        };

        let listen = match args.listen.as_ref().or(file.listen.as_ref()) {
            Some(listen) => Some(parse_listen(listen)?),
            None => None,
        };

        let connect = if args.connect.is_empty() {
            &file.connect
        } else {
            &args.connect
        }
        .iter()
        .map(|c| parse_peer(c))
        .collect::<Result<Vec<_>, _>>()?;

        let repeat_timeout = match (args.repeat_timeout, &file.repeat_timeout) {
            (Some(timeout), _) => timeout,
            (None, Some(timeout)) => {
                humantime::parse_duration(timeout).map_err(|e| Error::Options {
                    path: path.to_path_buf(),
                    message: format!("repeat_timeout: {e}"),
                })?
            }
            (None, None) => defaults.repeat_timeout,
        };

        let options = Options {
            driver: args
                .driver
                .clone()
                .or(file.driver)
                .unwrap_or(defaults.driver),
            device: args.device.clone().or(file.device),
            output: args.output.clone().or(file.output).unwrap_or(defaults.output),
            permission,
            listen,
            connect,
            pidfile: args.pidfile.clone().or(file.pidfile),
            allow_simulate: args.allow_simulate || file.allow_simulate.unwrap_or(false),
            release_suffix: args
                .release
                .clone()
                .or(file.release_suffix)
                .unwrap_or(defaults.release_suffix),
            repeat_max: args
                .repeat_max
                .or(file.repeat_max)
                .unwrap_or(defaults.repeat_max),
            repeat_timeout,
            config: args.config.clone().or(file.config).unwrap_or(defaults.config),
        };

        options.check()?;

        Ok(options)
    }

    /// The device the driver reads from, if it needs one
    pub fn device(&self) -> Option<PathBuf> {
        self.device
            .clone()
            .or_else(|| hardware::default_device(&self.driver))
    }

    fn check(&self) -> Result<(), Error> {
        if let Some(device) = &self.device {
            let same = match (fs::canonicalize(device), fs::canonicalize(&self.output)) {
                (Ok(device), Ok(output)) => device == output,
                _ => device == &self.output,
            };

            if same {
                return Err(Error::DeviceIsOutput(device.clone()));
            }
        }

        Ok(())
    }
}

fn parse_options_file(contents: &str, path: &Path) -> Result<FileOptions, Error> {
    toml::from_str::<OptionsFile>(contents)
        .map(|f| f.lircd)
        .map_err(|e| Error::Options {
            path: path.to_path_buf(),
            message: e.message().to_owned(),
        })
}

/// Parse an octal file mode such as `666` or `0660`
pub fn parse_permission(mode: &str) -> Result<u32, Error> {
    match u32::from_str_radix(mode, 8) {
        Ok(mode) if mode <= 0o7777 => Ok(mode),
        _ => Err(Error::InvalidPermission(mode.to_owned())),
    }
}

/// Parse `[address:]port`; without an address all interfaces are used
pub fn parse_listen(arg: &str) -> Result<SocketAddr, Error> {
    let (addr, port) = match arg.rsplit_once(':') {
        Some((addr, port)) => {
            let addr = addr
                .trim_start_matches('[')
                .trim_end_matches(']')
                .parse::<IpAddr>()
                .map_err(|_| Error::BadAddress(addr.to_owned()))?;

            (addr, port)
        }
        None => (IpAddr::V4(Ipv4Addr::UNSPECIFIED), arg),
    };

    let port = port
        .parse::<u16>()
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| Error::BadPort(port.to_owned()))?;

    Ok(SocketAddr::new(addr, port))
}
