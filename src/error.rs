use std::{io, path::PathBuf};
use thiserror::Error;

/// Errors which stop the daemon from starting. Anything that goes wrong with a
/// single client or peer connection is handled where it happens and never
/// ends up here.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid mode {0}")]
    InvalidPermission(String),

    #[error("driver `{0}' not supported")]
    UnknownDriver(String),

    #[error("refusing to connect to myself: device and output must not be the same file: {0}")]
    DeviceIsOutput(PathBuf),

    #[error("there's no hardware I can use and no peers are specified")]
    NoInput,

    #[error("bad address \"{0}\"")]
    BadAddress(String),

    #[error("bad port number \"{0}\"")]
    BadPort(String),

    #[error("too many peers, at most {0} are supported")]
    TooManyPeers(usize),

    #[error("{path}: {message}")]
    Options { path: PathBuf, message: String },

    #[error("{path}: {message}")]
    Catalogue { path: PathBuf, message: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }
}
