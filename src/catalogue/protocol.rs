/// A protocol as the linux kernel numbers them in `enum rc_proto`
pub struct KernelProtocol {
    pub name: &'static str,
    pub decoder: &'static str,
    pub protocol_no: u16,
}

impl KernelProtocol {
    pub fn by_number(protocol_no: u16) -> Option<&'static KernelProtocol> {
        KERNEL_PROTOCOLS
            .iter()
            .find(|e| e.protocol_no == protocol_no)
    }

    /// Match protocol name with regard for spaces or dashes or underscores.
    /// Behaviour should match protocol_match() in ir-ctl
    pub fn find_like(name: &str) -> Option<&'static KernelProtocol> {
        let name = str_like(name);

        KERNEL_PROTOCOLS.iter().find(|e| str_like(e.name) == name)
    }

    /// Does a keymap protocol name refer to this protocol, either by exact
    /// variant or by the decoder family which handles it
    pub fn matches(&self, name: &str) -> bool {
        let name = str_like(name);

        str_like(self.name) == name || str_like(self.decoder) == name
    }
}

fn str_like(name: &str) -> String {
    name.chars()
        .filter_map(|ch| {
            if matches!(ch, ' ' | '-' | '_') || !ch.is_ascii() {
                None
            } else {
                Some(ch.to_ascii_lowercase())
            }
        })
        .collect::<String>()
}

const KERNEL_PROTOCOLS: &[KernelProtocol] = &[
    KernelProtocol {
        name: "rc5",
        decoder: "rc5",
        protocol_no: 2,
    },
    KernelProtocol {
        name: "rc5x_20",
        decoder: "rc5",
        protocol_no: 3,
    },
    KernelProtocol {
        name: "rc5_sz",
        decoder: "rc5",
        protocol_no: 4,
    },
    KernelProtocol {
        name: "jvc",
        decoder: "jvc",
        protocol_no: 5,
    },
    KernelProtocol {
        name: "sony12",
        decoder: "sony",
        protocol_no: 6,
    },
    KernelProtocol {
        name: "sony15",
        decoder: "sony",
        protocol_no: 7,
    },
    KernelProtocol {
        name: "sony20",
        decoder: "sony",
        protocol_no: 8,
    },
    KernelProtocol {
        name: "nec",
        decoder: "nec",
        protocol_no: 9,
    },
    KernelProtocol {
        name: "necx",
        decoder: "nec",
        protocol_no: 10,
    },
    KernelProtocol {
        name: "nec32",
        decoder: "nec",
        protocol_no: 11,
    },
    KernelProtocol {
        name: "sanyo",
        decoder: "sanyo",
        protocol_no: 12,
    },
    KernelProtocol {
        name: "mcir2-kbd",
        decoder: "mce_kbd",
        protocol_no: 13,
    },
    KernelProtocol {
        name: "mcir2-mse",
        decoder: "mce_kbd",
        protocol_no: 14,
    },
    KernelProtocol {
        name: "rc6_0",
        decoder: "rc6",
        protocol_no: 15,
    },
    KernelProtocol {
        name: "rc6_6a_20",
        decoder: "rc6",
        protocol_no: 16,
    },
    KernelProtocol {
        name: "rc6_6a_24",
        decoder: "rc6",
        protocol_no: 17,
    },
    KernelProtocol {
        name: "rc6_6a_32",
        decoder: "rc6",
        protocol_no: 18,
    },
    KernelProtocol {
        name: "rc6_mce",
        decoder: "rc6",
        protocol_no: 19,
    },
    KernelProtocol {
        name: "sharp",
        decoder: "sharp",
        protocol_no: 20,
    },
    KernelProtocol {
        name: "xmp",
        decoder: "xmp",
        protocol_no: 21,
    },
    KernelProtocol {
        name: "cec",
        decoder: "cec",
        protocol_no: 22,
    },
    KernelProtocol {
        name: "imon",
        decoder: "imon",
        protocol_no: 23,
    },
    KernelProtocol {
        name: "rc-mm-12",
        decoder: "rc-mm",
        protocol_no: 24,
    },
    KernelProtocol {
        name: "rc-mm-24",
        decoder: "rc-mm",
        protocol_no: 25,
    },
    KernelProtocol {
        name: "rc-mm-32",
        decoder: "rc-mm",
        protocol_no: 26,
    },
    KernelProtocol {
        name: "xbox-dvd",
        decoder: "xbox-dvd",
        protocol_no: 27,
    },
];
