//! The read-only catalogue of remotes and their buttons

use std::time::Duration;

mod parse;
mod protocol;

pub use protocol::KernelProtocol;

/// One named button of a remote
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct Code {
    pub name: String,
    pub code: u64,
}

/// A remote, which is one entry of the `protocols` array of an rc keymap
#[derive(PartialEq, Eq, Debug, Default, Clone)]
pub struct Remote {
    pub name: String,
    pub protocol: String,
    pub variant: Option<String>,
    pub rc_protocol: Option<u16>,
    /// Overrides the daemon wide repeat timeout for this remote
    pub repeat_timeout: Option<Duration>,
    /// Sorted by scancode
    pub codes: Vec<Code>,
}

impl Remote {
    pub fn find_code(&self, name: &str) -> Option<&Code> {
        self.codes.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Does a decoded scancode from the kernel with the given protocol number belong to this remote
    pub fn accepts(&self, rc_protocol: u16) -> bool {
        if let Some(proto) = self.rc_protocol {
            return proto == rc_protocol;
        }

        let Some(kernel) = KernelProtocol::by_number(rc_protocol) else {
            return false;
        };

        match &self.variant {
            Some(variant) => {
                KernelProtocol::find_like(variant).is_some_and(|p| p.protocol_no == rc_protocol)
            }
            None => kernel.matches(&self.protocol),
        }
    }
}

#[derive(PartialEq, Eq, Debug, Default, Clone)]
pub struct Catalogue {
    remotes: Vec<Remote>,
}

impl Catalogue {
    pub fn new(remotes: Vec<Remote>) -> Self {
        Catalogue { remotes }
    }

    pub fn remotes(&self) -> &[Remote] {
        &self.remotes
    }

    pub fn is_empty(&self) -> bool {
        self.remotes.is_empty()
    }

    /// Remote names are matched case insensitively, like lircd always has
    pub fn find(&self, name: &str) -> Option<&Remote> {
        self.remotes
            .iter()
            .find(|r| r.name.eq_ignore_ascii_case(name))
    }

    pub fn find_scancode(&self, rc_protocol: u16, scancode: u64) -> Option<(&Remote, &Code)> {
        self.remotes
            .iter()
            .filter(|r| r.accepts(rc_protocol))
            .find_map(|r| {
                r.codes
                    .iter()
                    .find(|c| c.code == scancode)
                    .map(|c| (r, c))
            })
    }
}
