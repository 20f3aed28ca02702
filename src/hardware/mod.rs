//! Receiver hardware. Exactly one driver is chosen at startup and stays in use
//! until the daemon exits.

use crate::{catalogue::Catalogue, decode::Decode, error::Error};
use itertools::Itertools;
use std::{
    io,
    os::unix::io::RawFd,
    path::{Path, PathBuf},
};

#[cfg(target_os = "linux")]
mod devinput;
#[cfg(target_os = "linux")]
mod lirc;

#[cfg(target_os = "linux")]
pub use self::{devinput::DevInput, lirc::LircSource};

/// Something read from the device: the raw message for logging, and the
/// button if a complete one was recognised
#[derive(Debug, PartialEq, Eq)]
pub struct Reception {
    pub raw: String,
    pub decode: Option<Decode>,
}

pub trait HardwareSource {
    /// Name of the driver
    fn name(&self) -> &'static str;

    /// The device in use, if any
    fn device(&self) -> Option<&Path>;

    /// Descriptor to wait on for readability. Drivers without a descriptor
    /// are never polled.
    fn fd(&self) -> Option<RawFd>;

    /// Read what is available without blocking. `None` means there is
    /// nothing more to read until the descriptor becomes readable again.
    fn poll(&mut self, catalogue: &Catalogue) -> io::Result<Option<Reception>>;

    /// Called after every successful decode, for hardware which wants to
    /// know (e.g. to flash a led)
    fn notify_decoded(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Driver which never receives anything, for running with peers only
pub struct Null;

impl HardwareSource for Null {
    fn name(&self) -> &'static str {
        "null"
    }

    fn device(&self) -> Option<&Path> {
        None
    }

    fn fd(&self) -> Option<RawFd> {
        None
    }

    fn poll(&mut self, _catalogue: &Catalogue) -> io::Result<Option<Reception>> {
        Ok(None)
    }
}

#[cfg(target_os = "linux")]
pub const DRIVERS: &[&str] = &["null", "lirc", "devinput"];

#[cfg(not(target_os = "linux"))]
pub const DRIVERS: &[&str] = &["null"];

pub fn driver_list() -> String {
    DRIVERS.iter().map(|d| format!("\t{d}")).join("\n")
}

/// Resolve a driver name given on the command line or in the options file
pub fn find_driver(name: &str) -> Result<&'static str, Error> {
    // backwards compatibility
    let name = if name.eq_ignore_ascii_case("dev/input") {
        "devinput"
    } else {
        name
    };

    DRIVERS
        .iter()
        .find(|d| d.eq_ignore_ascii_case(name))
        .copied()
        .ok_or_else(|| Error::UnknownDriver(name.to_owned()))
}

/// Open the device with the given driver
pub fn open(driver: &str, device: &Path) -> Result<Box<dyn HardwareSource>, Error> {
    match find_driver(driver)? {
        #[cfg(target_os = "linux")]
        "lirc" => Ok(Box::new(
            LircSource::open(device).map_err(|e| Error::io(device.display().to_string(), e))?,
        )),
        #[cfg(target_os = "linux")]
        "devinput" => Ok(Box::new(
            DevInput::open(device).map_err(|e| Error::io(device.display().to_string(), e))?,
        )),
        _ => Ok(Box::new(Null)),
    }
}

/// The device path a driver will use when none is configured
pub fn default_device(driver: &str) -> Option<PathBuf> {
    match driver {
        "lirc" => Some(PathBuf::from("/dev/lirc0")),
        "devinput" => Some(PathBuf::from("/dev/input/event0")),
        _ => None,
    }
}
