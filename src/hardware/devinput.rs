//! Linux input devices, for receivers where the kernel already maps
//! scancodes to key codes

use super::{HardwareSource, Reception};
use crate::{catalogue::Catalogue, decode::Decode};
use evdev::{Device, InputEventKind};
use log::debug;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use std::{
    collections::VecDeque,
    io::{self, ErrorKind},
    os::unix::io::{AsRawFd, RawFd},
    path::{Path, PathBuf},
};

/// Every key is reported as a button of this remote
pub const DEVINPUT_REMOTE: &str = "devinput";

pub struct DevInput {
    path: PathBuf,
    device: Device,
    pending: VecDeque<Reception>,
}

impl DevInput {
    pub fn open(path: &Path) -> io::Result<Self> {
        let device = Device::open(path)?;

        fcntl(device.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;

        debug!(
            "{}: input device {}",
            path.display(),
            device.name().unwrap_or("unnamed")
        );

        Ok(DevInput {
            path: path.to_path_buf(),
            device,
            pending: VecDeque::new(),
        })
    }
}

impl HardwareSource for DevInput {
    fn name(&self) -> &'static str {
        "devinput"
    }

    fn device(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn fd(&self) -> Option<RawFd> {
        Some(self.device.as_raw_fd())
    }

    fn poll(&mut self, _catalogue: &Catalogue) -> io::Result<Option<Reception>> {
        // only key events are queued, so keep reading until one shows up
        while self.pending.is_empty() {
            match self.device.fetch_events() {
                Ok(iterator) => {
                    for ev in iterator {
                        let InputEventKind::Key(key) = ev.kind() else {
                            continue;
                        };

                        let button = format!("{key:?}");

                        // key up is implied by the repeat timeout
                        let reception = match ev.value() {
                            1 | 2 => Reception {
                                raw: format!("{button} {}", ev.value()),
                                decode: Some(Decode {
                                    remote: DEVINPUT_REMOTE.to_owned(),
                                    button,
                                    code: key.code().into(),
                                }),
                            },
                            value => Reception {
                                raw: format!("{button} {value}"),
                                decode: None,
                            },
                        };

                        self.pending.push_back(reception);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e),
            }
        }

        Ok(self.pending.pop_front())
    }
}
