//! Parse rc keymap toml files into a catalogue

use super::{Catalogue, Code, Remote};
use crate::error::Error;
use log::{debug, info};
use std::{
    ffi::OsStr,
    fs,
    path::{Path, PathBuf},
};
use toml::{Table, Value};

impl Catalogue {
    /// Load a keymap file, or every `.toml` file in a directory in name order
    pub fn load(path: &Path) -> Result<Catalogue, Error> {
        let mut remotes = Vec::new();

        if path.is_dir() {
            let mut files = fs::read_dir(path)
                .map_err(|e| Error::io(path.display().to_string(), e))?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.extension() == Some(OsStr::new("toml")))
                .collect::<Vec<PathBuf>>();

            files.sort();

            for file in files {
                remotes.extend(read_file(&file)?);
            }
        } else {
            remotes = read_file(path)?;
        }

        info!("loaded {} remotes from {}", remotes.len(), path.display());

        Ok(Catalogue { remotes })
    }

    /// Parse the contents of an rc keymap in toml format. No validation is done
    /// of button names or protocol names
    pub fn parse_text(contents: &str, filename: &Path) -> Result<Catalogue, Error> {
        Ok(Catalogue {
            remotes: parse_toml(contents, filename)?,
        })
    }
}

fn read_file(path: &Path) -> Result<Vec<Remote>, Error> {
    debug!("parsing {} as keymap", path.display());

    let contents =
        fs::read_to_string(path).map_err(|e| Error::io(path.display().to_string(), e))?;

    parse_toml(&contents, path)
}

fn string_to_scancode(s: &str) -> Result<u64, std::num::ParseIntError> {
    if let Some(hex) = s.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
    } else {
        str::parse(s)
    }
}

fn parse_toml(contents: &str, filename: &Path) -> Result<Vec<Remote>, Error> {
    let err = |message: String| Error::Catalogue {
        path: filename.to_path_buf(),
        message,
    };

    let top = contents
        .parse::<Table>()
        .map_err(|e| err(format!("{e}")))?;

    let Some(Value::Array(protocols)) = top.get("protocols") else {
        return Err(err("missing top level protocols array".into()));
    };

    let mut res = Vec::new();

    for entry in protocols {
        let Some(Value::String(name)) = entry.get("name") else {
            return Err(err("missing name".into()));
        };

        if name.contains(char::is_whitespace) {
            return Err(err(format!("remote name '{name}' contains whitespace")));
        }

        let Some(Value::String(protocol)) = entry.get("protocol") else {
            return Err(err(format!("{name}: missing protocol")));
        };

        let mut variant = None;
        if let Some(Value::String(entry)) = entry.get("variant") {
            variant = Some(entry.to_owned());
        }

        let mut rc_protocol = None;
        if let Some(Value::Integer(n)) = entry.get("rc_protocol") {
            if let Ok(n) = (*n).try_into() {
                rc_protocol = Some(n);
            } else {
                return Err(err(format!("rc_protocol {n} must be 16 bit value")));
            }
        }

        let mut repeat_timeout = None;
        if let Some(Value::String(timeout)) = entry.get("repeat_timeout") {
            repeat_timeout = Some(
                humantime::parse_duration(timeout)
                    .map_err(|e| err(format!("{name}: repeat_timeout: {e}")))?,
            );
        }

        let mut codes = Vec::new();

        if let Some(Value::Table(scancodes)) = entry.get("scancodes") {
            for (scancode, keycode) in scancodes {
                let code = string_to_scancode(scancode)
                    .map_err(|_| err(format!("{scancode} is a not valid scancode")))?;
                let Value::String(keycode) = keycode else {
                    return Err(err("keycode should be string".into()));
                };

                if keycode.is_empty() || keycode.contains(char::is_whitespace) {
                    return Err(err(format!("'{keycode}' is not a valid button name")));
                }

                codes.push(Code {
                    name: keycode.to_owned(),
                    code,
                });
            }
        }

        codes.sort_by_key(|c| c.code);

        res.push(Remote {
            name: name.to_owned(),
            protocol: protocol.to_owned(),
            variant,
            rc_protocol,
            repeat_timeout,
            codes,
        });
    }

    Ok(res)
}
