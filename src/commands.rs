//! Commands clients can send, one per line

use crate::{
    catalogue::Catalogue,
    decode::{Decode, DecodeState, DecodedEvent},
    wire::{format_reply, parse_event, Outcome},
};
use log::debug;
use std::time::Instant;

/// Shared state the commands read and modify
pub struct Context<'a> {
    pub catalogue: &'a Catalogue,
    pub decode: &'a mut DecodeState,
    pub release_suffix: &'a mut String,
    pub now: Instant,
    /// Events to broadcast, produced by simulating button presses
    pub events: Vec<DecodedEvent>,
}

/// One command line from a client
pub struct Invocation<'a> {
    pub verb: &'a str,
    pub argument: &'a str,
    pub allow_simulate: bool,
}

type Handler = fn(&mut Context, &Invocation) -> Result<Vec<String>, String>;

const DIRECTIVES: &[(&str, Handler)] = &[
    ("LIST", list),
    ("SIMULATE", simulate),
    ("VERSION", version),
    ("RELEASE_SUFFIX", release_suffix),
];

/// Run a command line and produce the reply envelope. Events in
/// `ctx.events` must be broadcast before the reply is sent.
pub fn dispatch(ctx: &mut Context, line: &str, allow_simulate: bool) -> String {
    let command = line.trim();

    let (verb, argument) = match command.split_once(|c: char| c.is_ascii_whitespace()) {
        Some((verb, argument)) => (verb, argument.trim()),
        None => (command, ""),
    };

    let invocation = Invocation {
        verb,
        argument,
        allow_simulate,
    };

    let outcome = match DIRECTIVES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(verb))
    {
        Some((_, handler)) => match handler(ctx, &invocation) {
            Ok(data) => Outcome::Success(data),
            Err(message) => {
                debug!("{command}: {message}");
                Outcome::Error(vec![message])
            }
        },
        None => {
            debug!("unknown directive: \"{verb}\"");
            Outcome::Error(Vec::new())
        }
    };

    format_reply(command, &outcome)
}

fn list(ctx: &mut Context, inv: &Invocation) -> Result<Vec<String>, String> {
    let mut args = inv.argument.split_ascii_whitespace();

    match (args.next(), args.next(), args.next()) {
        (None, _, _) => Ok(ctx
            .catalogue
            .remotes()
            .iter()
            .map(|r| r.name.clone())
            .collect()),
        (Some(remote), None, _) => {
            let remote = ctx
                .catalogue
                .find(remote)
                .ok_or_else(|| format!("unknown remote: \"{remote}\""))?;

            Ok(remote
                .codes
                .iter()
                .map(|c| format!("{:016x} {}", c.code, c.name))
                .collect())
        }
        (Some(remote), Some(button), None) => {
            let remote = ctx
                .catalogue
                .find(remote)
                .ok_or_else(|| format!("unknown remote: \"{remote}\""))?;

            let code = remote
                .find_code(button)
                .ok_or_else(|| format!("unknown command: \"{button}\""))?;

            Ok(vec![format!("{:016x} {}", code.code, code.name)])
        }
        _ => Err(format!("bad send packet: \"{}\"", inv.argument)),
    }
}

/// Feed a button press through the decoder as if it came from the hardware.
/// The argument is a broadcast line; its repeat count is ignored since the
/// decoder does its own counting.
fn simulate(ctx: &mut Context, inv: &Invocation) -> Result<Vec<String>, String> {
    if !inv.allow_simulate {
        return Err(String::from("SIMULATE command is disabled"));
    }

    let event = parse_event(inv.argument, ctx.release_suffix.as_str())?;

    let remote = ctx
        .catalogue
        .find(event.remote)
        .ok_or_else(|| format!("unknown remote: \"{}\"", event.remote))?;

    let code = remote
        .find_code(event.button)
        .ok_or_else(|| format!("unknown command: \"{}\"", event.button))?;

    if event.release {
        ctx.events
            .extend(ctx.decode.release(&remote.name, &code.name));
    } else {
        let events = ctx.decode.decode(
            Decode {
                remote: remote.name.clone(),
                button: code.name.clone(),
                code: event.code,
            },
            remote.repeat_timeout,
            ctx.now,
        );

        ctx.events.extend(events);
    }

    Ok(Vec::new())
}

fn version(_ctx: &mut Context, inv: &Invocation) -> Result<Vec<String>, String> {
    if !inv.argument.is_empty() {
        return Err(format!("bad send packet: \"{}\"", inv.argument));
    }

    Ok(vec![env!("CARGO_PKG_VERSION").to_owned()])
}

/// Without argument, report the suffix of release events; with one, change it
fn release_suffix(ctx: &mut Context, inv: &Invocation) -> Result<Vec<String>, String> {
    let mut args = inv.argument.split_ascii_whitespace();

    match (args.next(), args.next()) {
        (None, _) => Ok(vec![ctx.release_suffix.clone()]),
        (Some(suffix), None) => {
            debug!("release suffix set to {suffix}");
            *ctx.release_suffix = suffix.to_owned();
            Ok(Vec::new())
        }
        _ => Err(format!("bad send packet: \"{}\"", inv.argument)),
    }
}
