//! A daemon which decodes infrared remote button presses and broadcasts them
//! to clients connected over a unix socket or tcp, speaking the lircd protocol

pub mod catalogue;
pub mod client;
pub mod commands;
pub mod daemon;
pub mod decode;
pub mod error;
pub mod hardware;
pub mod listener;
pub mod log;
pub mod options;
pub mod peer;
pub mod pidfile;
pub mod wire;

pub use error::Error;
