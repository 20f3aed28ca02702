//! The lircd socket protocol: broadcast lines, reply envelopes and line framing

use crate::decode::DecodedEvent;
use std::fmt::Write;

/// Longest command line a client may send, including the newline
pub const PACKET_SIZE: usize = 256;

/// Default suffix appended to the button name of release events
pub const RELEASE_SUFFIX: &str = "_UP";

/// Format a decoded event the way lirc clients expect it:
/// `<code> <repeat> <button><suffix> <remote>`
pub fn format_event(event: &DecodedEvent, release_suffix: &str) -> String {
    format!(
        "{:016x} {:02x} {}{} {}\n",
        event.code,
        event.repeat,
        event.button,
        if event.release { release_suffix } else { "" },
        event.remote
    )
}

/// A broadcast line as received from a peer or in a SIMULATE command
#[derive(Debug, PartialEq, Eq)]
pub struct EventLine<'a> {
    pub code: u64,
    pub repeat: u32,
    pub button: &'a str,
    pub remote: &'a str,
    pub release: bool,
}

/// Parse a broadcast line. The release flag is recovered from the button name
/// suffix; an empty suffix means releases cannot be recognised.
pub fn parse_event<'a>(line: &'a str, release_suffix: &str) -> Result<EventLine<'a>, String> {
    let mut words = line.split_ascii_whitespace();

    let (Some(code), Some(repeat), Some(button), Some(remote), None) = (
        words.next(),
        words.next(),
        words.next(),
        words.next(),
        words.next(),
    ) else {
        return Err(format!("bad send packet: \"{}\"", line.trim_end()));
    };

    let code = u64::from_str_radix(code, 16).map_err(|_| format!("bad code: \"{code}\""))?;

    let repeat =
        u32::from_str_radix(repeat, 16).map_err(|_| format!("bad repeat count: \"{repeat}\""))?;

    let (button, release) = match button.strip_suffix(release_suffix) {
        Some(stripped) if !release_suffix.is_empty() && !stripped.is_empty() => (stripped, true),
        _ => (button, false),
    };

    Ok(EventLine {
        code,
        repeat,
        button,
        remote,
        release,
    })
}

/// The result of one command
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Success(Vec<String>),
    Error(Vec<String>),
}

/// Frame a reply: `BEGIN`, the command as received, `SUCCESS` or `ERROR`, an
/// optional `DATA` section and `END`
pub fn format_reply(command: &str, outcome: &Outcome) -> String {
    let (status, data) = match outcome {
        Outcome::Success(data) => ("SUCCESS", data),
        Outcome::Error(data) => ("ERROR", data),
    };

    let mut reply = format!("BEGIN\n{command}\n{status}\n");

    if !data.is_empty() {
        let _ = write!(reply, "DATA\n{}\n", data.len());

        for line in data {
            reply.push_str(line);
            reply.push('\n');
        }
    }

    reply.push_str("END\n");

    reply
}

/// Sent to every client after the remote catalogue has been re-read
pub const SIGHUP_MESSAGE: &str = "BEGIN\nSIGHUP\nEND\n";

#[derive(Debug, PartialEq, Eq)]
pub enum FramingError {
    TooLong,
    Garbled,
}

/// Collects bytes from a stream and splits them into lines
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Take the next complete line without its terminator. Once the pending
    /// bytes hold no newline and exceed the packet size, the stream can no
    /// longer be framed.
    pub fn next_line(&mut self) -> Result<Option<String>, FramingError> {
        let Some(pos) = self.buf.iter().position(|b| *b == b'\n') else {
            return if self.buf.len() >= PACKET_SIZE {
                Err(FramingError::TooLong)
            } else {
                Ok(None)
            };
        };

        if pos >= PACKET_SIZE {
            return Err(FramingError::TooLong);
        }

        let mut line = self.buf.drain(..=pos).collect::<Vec<u8>>();

        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }

        String::from_utf8(line)
            .map(Some)
            .map_err(|_| FramingError::Garbled)
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
