//! lirc chardev receiving decoded scancodes from the kernel

use super::{HardwareSource, Reception};
use crate::{catalogue::Catalogue, decode::Decode};
use log::{debug, trace};
use nix::{
    fcntl::{fcntl, FcntlArg, OFlag},
    ioctl_none, ioctl_read, ioctl_write_ptr,
};
use std::{
    collections::VecDeque,
    fmt,
    fs::{File, OpenOptions},
    io::{self, Error, ErrorKind, Read},
    mem,
    os::unix::io::{AsRawFd, RawFd},
    path::{Path, PathBuf},
};

const LIRC_MAGIC: u8 = b'i';

const LIRC_GET_FEATURES: u8 = 0x00;
const LIRC_SET_REC_MODE: u8 = 0x12;
const LIRC_NOTIFY_DECODE: u8 = 0x20;

ioctl_read!(lirc_get_features, LIRC_MAGIC, LIRC_GET_FEATURES, u32);
ioctl_write_ptr!(lirc_set_rec_mode, LIRC_MAGIC, LIRC_SET_REC_MODE, u32);
ioctl_none!(lirc_notify_decode, LIRC_MAGIC, LIRC_NOTIFY_DECODE);

const LIRC_CAN_REC_SCANCODE: u32 = 0x00080000;
const LIRC_CAN_NOTIFY_DECODE: u32 = 0x01000000;

const LIRC_MODE_SCANCODE: u32 = 0x00000008;

pub const LIRC_SCANCODE_FLAG_TOGGLE: u16 = 1;
pub const LIRC_SCANCODE_FLAG_REPEAT: u16 = 2;

/// Type used for receiving decoded IR.
#[repr(C)]
#[derive(Debug)]
pub struct LircScancode {
    pub timestamp: u64,
    pub flags: u16,
    pub rc_proto: u16,
    pub keycode: u32,
    pub scancode: u64,
}

/// A lirc device in scancode mode
pub struct Lirc {
    path: PathBuf,
    file: File,
    features: u32,
}

impl Lirc {
    /// Open a lirc chardev, which should have a path like "/dev/lirc0"
    pub fn open(path: &Path) -> io::Result<Lirc> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut features = 0u32;

        if let Ok(0) = unsafe { lirc_get_features(file.as_raw_fd(), &mut features) } {
            Ok(Lirc {
                path: PathBuf::from(path),
                file,
                features,
            })
        } else {
            Err(Error::new(
                ErrorKind::NotFound,
                String::from("not a lirc device"),
            ))
        }
    }

    /// Does this lirc device support receiving in decoded scancode format
    pub fn can_receive_scancodes(&self) -> bool {
        (self.features & LIRC_CAN_REC_SCANCODE) != 0
    }

    /// Does the driver want to be told when lircd decoded something
    pub fn can_notify_decode(&self) -> bool {
        (self.features & LIRC_CAN_NOTIFY_DECODE) != 0
    }

    /// Switch to scancode mode
    pub fn scancode_mode(&mut self) -> io::Result<()> {
        let mode = LIRC_MODE_SCANCODE;

        unsafe { lirc_set_rec_mode(self.file.as_raw_fd(), &mode)? };

        Ok(())
    }

    pub fn set_nonblocking(&self) -> io::Result<()> {
        fcntl(self.file.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;

        Ok(())
    }

    /// Read the decoded IR. If there is nothing to be read, the result vector will be
    /// set to length 0. Otherwise, up to the capacity of result entries will be read.
    pub fn receive_scancodes(&mut self, result: &mut Vec<LircScancode>) -> io::Result<()> {
        let length = result.capacity() * mem::size_of::<LircScancode>();
        let data = unsafe { std::slice::from_raw_parts_mut(result.as_ptr() as *mut u8, length) };

        let res = self.file.read(data)?;

        unsafe {
            result.set_len(res / mem::size_of::<LircScancode>());
        }

        Ok(())
    }

    pub fn notify_decode(&mut self) -> io::Result<()> {
        unsafe { lirc_notify_decode(self.file.as_raw_fd())? };

        Ok(())
    }
}

impl AsRawFd for Lirc {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl fmt::Display for Lirc {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(f, "{}", self.path.display())
    }
}

/// The `lirc` driver: buttons are looked up by kernel protocol and scancode
pub struct LircSource {
    lirc: Lirc,
    buf: Vec<LircScancode>,
    pending: VecDeque<LircScancode>,
}

impl LircSource {
    pub fn open(path: &Path) -> io::Result<Self> {
        let mut lirc = Lirc::open(path)?;

        if !lirc.can_receive_scancodes() {
            return Err(Error::new(
                ErrorKind::Unsupported,
                format!("{lirc}: device cannot receive scancodes"),
            ));
        }

        lirc.scancode_mode()?;
        lirc.set_nonblocking()?;

        debug!("{lirc}: receiving scancodes");

        Ok(LircSource {
            lirc,
            buf: Vec::with_capacity(64),
            pending: VecDeque::new(),
        })
    }
}

impl HardwareSource for LircSource {
    fn name(&self) -> &'static str {
        "lirc"
    }

    fn device(&self) -> Option<&Path> {
        Some(&self.lirc.path)
    }

    fn fd(&self) -> Option<RawFd> {
        Some(self.lirc.as_raw_fd())
    }

    fn poll(&mut self, catalogue: &Catalogue) -> io::Result<Option<Reception>> {
        if self.pending.is_empty() {
            match self.lirc.receive_scancodes(&mut self.buf) {
                Ok(()) => self.pending.extend(self.buf.drain(..)),
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(err) => return Err(err),
            }
        }

        let Some(entry) = self.pending.pop_front() else {
            return Ok(None);
        };

        let raw = format!(
            "scancode={:x} protocol={}{}{}",
            entry.scancode,
            entry.rc_proto,
            if (entry.flags & LIRC_SCANCODE_FLAG_REPEAT) != 0 {
                " repeat"
            } else {
                ""
            },
            if (entry.flags & LIRC_SCANCODE_FLAG_TOGGLE) != 0 {
                " toggle"
            } else {
                ""
            },
        );

        let decode = catalogue
            .find_scancode(entry.rc_proto, entry.scancode)
            .map(|(remote, code)| Decode {
                remote: remote.name.clone(),
                button: code.name.clone(),
                code: code.code,
            });

        if decode.is_none() {
            trace!("{}: {raw} not in any remote", self.lirc);
        }

        Ok(Some(Reception { raw, decode }))
    }

    fn notify_decoded(&mut self) -> io::Result<()> {
        if self.lirc.can_notify_decode() {
            self.lirc.notify_decode()
        } else {
            Ok(())
        }
    }
}
