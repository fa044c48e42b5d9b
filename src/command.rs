//! Static metadata about the bus commands.
//!
//! The bus protocol has no framing: how many data bytes follow a command and
//! how many bytes the flock answers with is known only by convention. The
//! [Catalog] records that convention so a session can predict the response
//! to anything it writes. CHANGE VALUE and EXAMINE VALUE take their sizes from
//! the [ParameterEntry] named by the byte after the command.
//!
//! The catalog is built once, on first use, and never changes afterwards.

use std::{collections::HashMap, fmt, sync::OnceLock};

/// Command bytes.
pub mod cmd {
    #![allow(missing_docs)]
    pub const STREAM: u8 = 0x40;
    pub const SYNC: u8 = 0x41;
    pub const POINT: u8 = 0x42;
    pub const RUN: u8 = 0x46;
    pub const SLEEP: u8 = 0x47;
    pub const REFERENCE_FRAME: u8 = 0x48;
    pub const ANGLE_ALIGN: u8 = 0x4a;
    pub const HEMISPHERE: u8 = 0x4c;
    pub const BUTTON_MODE: u8 = 0x4d;
    pub const BUTTON_READ: u8 = 0x4e;
    pub const EXAMINE_VALUE: u8 = 0x4f;
    pub const CHANGE_VALUE: u8 = 0x50;
    pub const REPORT_RATE_1: u8 = 0x51;
    pub const REPORT_RATE_2: u8 = 0x52;
    pub const REPORT_RATE_8: u8 = 0x53;
    pub const REPORT_RATE_32: u8 = 0x54;
    pub const POSITION: u8 = 0x56;
    pub const ANGLES: u8 = 0x57;
    pub const MATRIX: u8 = 0x58;
    pub const POSITION_ANGLES: u8 = 0x59;
    pub const POSITION_MATRIX: u8 = 0x5a;
    pub const QUATERNION: u8 = 0x5c;
    pub const POSITION_QUATERNION: u8 = 0x5d;
    pub const FACTORY_TEST: u8 = 0x7a;
    pub const XON: u8 = 0x11;
    pub const XOFF: u8 = 0x13;
    /// Followed by the transmitter number.
    pub const NEXT_TRANSMITTER: u8 = 0x30;
    /// Low nibble (1 to 15) is the new master address.
    pub const NEXT_MASTER: u8 = 0x30;
    /// Low nibble is the unit address (0 to 15).
    pub const RS232_TO_FBB: u8 = 0xf0;
    /// Low nibble is the unit address minus 16.
    pub const RS232_TO_FBB_EXPANDED: u8 = 0xe0;
}

/// Parameter bytes for CHANGE VALUE and EXAMINE VALUE.
pub mod param {
    #![allow(missing_docs)]
    pub const BIRD_SYSTEM_STATUS: u8 = 0x00;
    pub const SOFTWARE_REVISION_NUMBER: u8 = 0x01;
    pub const CRYSTAL_SPEED: u8 = 0x02;
    pub const POSITION_SCALING: u8 = 0x03;
    pub const FILTER_ON_OFF_STATUS: u8 = 0x04;
    pub const DC_FILTER_ALPHA_MIN: u8 = 0x05;
    pub const MEASUREMENT_RATE: u8 = 0x06;
    pub const DATA_READY_OUTPUT: u8 = 0x08;
    pub const DATA_READY_CHARACTER: u8 = 0x09;
    pub const ERROR_CODE: u8 = 0x0a;
    pub const ERROR_DETECT_MASK: u8 = 0x0b;
    pub const DC_FILTER_TABLE_VM: u8 = 0x0c;
    pub const DC_FILTER_ALPHA_MAX: u8 = 0x0d;
    pub const SUDDEN_OUTPUT_CHANGE_LOCK: u8 = 0x0e;
    pub const SYSTEM_MODEL_IDENTIFICATION: u8 = 0x0f;
    pub const EXPANDED_ERROR_CODE: u8 = 0x10;
    pub const XYZ_REFERENCE_FRAME: u8 = 0x11;
    pub const FBB_HOST_RESPONSE_DELAY: u8 = 0x20;
    pub const FBB_CONFIGURATION: u8 = 0x21;
    pub const FBB_ARM: u8 = 0x22;
    pub const GROUP_MODE: u8 = 0x23;
    pub const FLOCK_SYSTEM_STATUS: u8 = 0x24;
    pub const FBB_AUTO_CONFIGURATION: u8 = 0x32;
}

/// A byte count that is either fixed or depends on run-time state
/// (addressing mode, group mode, record mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Size {
    #[allow(missing_docs)]
    Fixed(usize),
    #[allow(missing_docs)]
    Variable,
}

impl Size {
    /// The byte count, if it is fixed.
    pub fn fixed(self) -> Option<usize> {
        match self {
            Size::Fixed(n) => Some(n),
            Size::Variable => None,
        }
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Size::Fixed(n) => write!(f, "{}", n),
            Size::Variable => write!(f, "variable"),
        }
    }
}

/// What the catalog knows about one command byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandEntry {
    /// Name from the device manual
    pub name: &'static str,
    /// Data bytes following the command byte
    pub data: Size,
    /// Bytes the flock answers with
    pub response: Size,
    /// Whether the command changes the operating mode of a unit
    pub changes_mode: bool,
}

/// What the catalog knows about one CHANGE / EXAMINE parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterEntry {
    /// Name from the device manual
    pub name: &'static str,
    /// Whether CHANGE VALUE accepts this parameter
    pub changeable: bool,
    /// Data bytes of a CHANGE VALUE, not counting the parameter byte
    pub data: Size,
    /// Bytes answered to an EXAMINE VALUE
    pub response: Size,
    /// Whether changing it changes the operating mode
    pub changes_mode: bool,
}

/// Resolved sizes of a complete command, including the parameter of CHANGE
/// VALUE and EXAMINE VALUE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSizes {
    /// Name of the command (and parameter)
    pub name: &'static str,
    /// Data bytes after the command byte
    pub data: Size,
    /// Bytes the flock answers with
    pub response: Size,
    /// Whether the command changes the operating mode of a unit
    pub changes_mode: bool,
}

impl CommandSizes {
    /// Total bytes of the command on the wire, command byte included.
    pub fn wire_size(&self) -> Option<usize> {
        self.data.fixed().map(|n| n + 1)
    }
}

use Size::{Fixed, Variable};

const fn command(
    name: &'static str,
    data: Size,
    response: Size,
    changes_mode: bool,
) -> CommandEntry {
    CommandEntry {
        name,
        data,
        response,
        changes_mode,
    }
}

const fn parameter(
    name: &'static str,
    changeable: bool,
    data: Size,
    response: Size,
    changes_mode: bool,
) -> ParameterEntry {
    ParameterEntry {
        name,
        changeable,
        data,
        response,
        changes_mode,
    }
}

const COMMANDS: &[(u8, CommandEntry)] = &[
    (cmd::ANGLES, command("ANGLES", Fixed(0), Fixed(0), true)),
    (cmd::ANGLE_ALIGN, command("ANGLE ALIGN", Fixed(12), Fixed(0), false)),
    (cmd::BUTTON_MODE, command("BUTTON MODE", Fixed(1), Fixed(0), true)),
    (cmd::BUTTON_READ, command("BUTTON READ", Fixed(0), Fixed(1), false)),
    // Sizes and mode flag come from the parameter.
    (cmd::CHANGE_VALUE, command("CHANGE VALUE", Variable, Fixed(0), false)),
    (cmd::EXAMINE_VALUE, command("EXAMINE VALUE", Fixed(1), Variable, false)),
    (cmd::FACTORY_TEST, command("FACTORY TEST", Fixed(0), Fixed(0), false)),
    (cmd::HEMISPHERE, command("HEMISPHERE", Fixed(2), Fixed(0), false)),
    (cmd::MATRIX, command("MATRIX", Fixed(0), Fixed(0), true)),
    // Depends on group and record mode.
    (cmd::POINT, command("POINT", Fixed(0), Variable, false)),
    (cmd::POSITION, command("POSITION", Fixed(0), Fixed(0), true)),
    (cmd::POSITION_ANGLES, command("POSITION ANGLES", Fixed(0), Fixed(0), true)),
    (cmd::POSITION_MATRIX, command("POSITION MATRIX", Fixed(0), Fixed(0), true)),
    (
        cmd::POSITION_QUATERNION,
        command("POSITION QUATERNION", Fixed(0), Fixed(0), true),
    ),
    (cmd::QUATERNION, command("QUATERNION", Fixed(0), Fixed(0), true)),
    (cmd::REFERENCE_FRAME, command("REFERENCE FRAME", Fixed(12), Fixed(0), false)),
    (cmd::REPORT_RATE_1, command("REPORT RATE 1 CYCLE", Fixed(0), Fixed(0), false)),
    (cmd::REPORT_RATE_2, command("REPORT RATE 2 CYCLE", Fixed(0), Fixed(0), false)),
    (cmd::REPORT_RATE_8, command("REPORT RATE 8 CYCLE", Fixed(0), Fixed(0), false)),
    (cmd::REPORT_RATE_32, command("REPORT RATE 32 CYCLE", Fixed(0), Fixed(0), false)),
    (cmd::RUN, command("RUN", Fixed(0), Fixed(0), true)),
    (cmd::SLEEP, command("SLEEP", Fixed(0), Fixed(0), true)),
    // Starts a continuous stream of records.
    (cmd::STREAM, command("STREAM", Fixed(0), Variable, true)),
    (cmd::SYNC, command("SYNC", Fixed(1), Fixed(0), false)),
    (cmd::XON, command("XON", Fixed(0), Fixed(0), true)),
    (cmd::XOFF, command("XOFF", Fixed(0), Fixed(0), true)),
    (cmd::NEXT_TRANSMITTER, command("NEXT TRANSMITTER", Fixed(1), Fixed(0), false)),
];

const NEXT_MASTER: CommandEntry = command("NEXT MASTER", Fixed(0), Fixed(0), false);
const RS232_TO_FBB: CommandEntry = command("RS232 TO FBB", Fixed(0), Fixed(0), false);
const RS232_TO_FBB_EXPANDED: CommandEntry =
    command("EXPANDED RS232 TO FBB", Fixed(0), Fixed(0), false);

const PARAMETERS: &[(u8, ParameterEntry)] = &[
    (
        param::BIRD_SYSTEM_STATUS,
        parameter("BIRD SYSTEM STATUS", false, Fixed(0), Fixed(2), false),
    ),
    (
        param::SOFTWARE_REVISION_NUMBER,
        parameter("SOFTWARE REVISION NUMBER", false, Fixed(0), Fixed(2), false),
    ),
    (
        param::CRYSTAL_SPEED,
        parameter("BIRD COMPUTER CRYSTAL SPEED", false, Fixed(0), Fixed(2), false),
    ),
    (
        param::POSITION_SCALING,
        parameter("POSITION SCALING", true, Fixed(2), Fixed(2), false),
    ),
    (
        param::FILTER_ON_OFF_STATUS,
        parameter("FILTER ON OFF STATUS", true, Fixed(2), Fixed(2), false),
    ),
    (
        param::DC_FILTER_ALPHA_MIN,
        parameter("DC FILTER CONSTANT TABLE ALPHA MIN", true, Fixed(14), Fixed(14), false),
    ),
    (
        param::MEASUREMENT_RATE,
        parameter("BIRD MEASUREMENT RATE", true, Fixed(2), Fixed(2), false),
    ),
    (
        param::DATA_READY_OUTPUT,
        parameter("DISABLE ENABLE DATA READY OUTPUT", true, Fixed(1), Fixed(1), true),
    ),
    (
        param::DATA_READY_CHARACTER,
        parameter("CHANGES DATA READY CHARACTER", true, Fixed(1), Fixed(1), false),
    ),
    (
        param::ERROR_CODE,
        parameter("ERROR CODE", false, Fixed(0), Fixed(1), false),
    ),
    (
        param::ERROR_DETECT_MASK,
        parameter("ERROR DETECT MASK", true, Fixed(1), Fixed(1), false),
    ),
    (
        param::DC_FILTER_TABLE_VM,
        parameter("DC FILTER TABLE VM", true, Fixed(14), Fixed(14), false),
    ),
    (
        param::DC_FILTER_ALPHA_MAX,
        parameter("DC FILTER CONSTANT TABLE ALPHA MAX", true, Fixed(14), Fixed(14), false),
    ),
    (
        param::SUDDEN_OUTPUT_CHANGE_LOCK,
        parameter("SUDDEN OUTPUT CHANGE LOCK", true, Fixed(1), Fixed(1), false),
    ),
    (
        param::SYSTEM_MODEL_IDENTIFICATION,
        parameter("SYSTEM MODEL IDENTIFICATION", false, Fixed(0), Fixed(10), false),
    ),
    (
        param::EXPANDED_ERROR_CODE,
        parameter("EXPANDED ERROR CODE", false, Fixed(0), Fixed(2), false),
    ),
    (
        param::XYZ_REFERENCE_FRAME,
        parameter("XYZ REFERENCE FRAME", true, Fixed(1), Fixed(1), false),
    ),
    (
        param::FBB_HOST_RESPONSE_DELAY,
        parameter("FBB HOST RESPONSE DELAY", true, Fixed(2), Fixed(2), false),
    ),
    // 5 bytes in normal addressing, 7 in expanded.
    (
        param::FBB_CONFIGURATION,
        parameter("FBB CONFIGURATION", true, Variable, Variable, true),
    ),
    // 14 bytes in normal addressing, 30 in expanded.
    (
        param::FBB_ARM,
        parameter("FBB ARM", true, Variable, Variable, true),
    ),
    (
        param::GROUP_MODE,
        parameter("GROUP MODE", true, Fixed(1), Fixed(1), true),
    ),
    // 14, 30 or 126 bytes depending on addressing mode.
    (
        param::FLOCK_SYSTEM_STATUS,
        parameter("FLOCK SYSTEM STATUS", false, Fixed(0), Variable, false),
    ),
    // 5, 7 or 19 bytes depending on addressing mode.
    (
        param::FBB_AUTO_CONFIGURATION,
        parameter("FBB AUTO CONFIGURATION", true, Fixed(1), Variable, true),
    ),
];

/// Unit address 31 cannot be routed to, and neither can the last normal
/// routing byte.
const ILLEGAL_ROUTING_BYTES: [u8; 2] = [
    cmd::RS232_TO_FBB | 0x0f,
    cmd::RS232_TO_FBB_EXPANDED | 0x0f,
];

/// Lookup tables for command and parameter bytes.
#[derive(Debug)]
pub struct Catalog {
    commands: HashMap<u8, CommandEntry>,
    parameters: HashMap<u8, ParameterEntry>,
}

impl Catalog {
    fn build() -> Self {
        let mut commands: HashMap<u8, CommandEntry> = COMMANDS.iter().copied().collect();

        // Address 0 is not a valid master.
        for address in 1..16 {
            commands.insert(cmd::NEXT_MASTER | address, NEXT_MASTER);
        }
        for address in 0..16 {
            commands.insert(cmd::RS232_TO_FBB | address, RS232_TO_FBB);
            commands.insert(cmd::RS232_TO_FBB_EXPANDED | address, RS232_TO_FBB_EXPANDED);
        }
        for byte in ILLEGAL_ROUTING_BYTES {
            commands.remove(&byte);
        }

        Catalog {
            commands,
            parameters: PARAMETERS.iter().copied().collect(),
        }
    }

    /// Entry of a single command byte, or `None` if it is not registered.
    pub fn command(&self, byte: u8) -> Option<&CommandEntry> {
        self.commands.get(&byte)
    }

    /// Entry of a parameter byte, or `None` if it is not registered.
    pub fn parameter(&self, byte: u8) -> Option<&ParameterEntry> {
        self.parameters.get(&byte)
    }

    /// Resolve the sizes of the command at the start of `bytes`. CHANGE
    /// VALUE and EXAMINE VALUE also need the parameter byte that follows;
    /// without it, or with an unregistered parameter, the command is
    /// unknown. A parameter that cannot be changed is unknown to CHANGE
    /// VALUE.
    pub fn lookup(&self, bytes: &[u8]) -> Option<CommandSizes> {
        let (&byte, rest) = bytes.split_first()?;
        let entry = self.command(byte)?;

        match byte {
            cmd::CHANGE_VALUE => {
                let param = self.parameter(*rest.first()?)?;
                if !param.changeable {
                    return None;
                }
                Some(CommandSizes {
                    name: param.name,
                    data: match param.data {
                        Fixed(n) => Fixed(n + 1),
                        Variable => Variable,
                    },
                    response: entry.response,
                    changes_mode: param.changes_mode,
                })
            }
            cmd::EXAMINE_VALUE => {
                let param = self.parameter(*rest.first()?)?;
                Some(CommandSizes {
                    name: param.name,
                    data: entry.data,
                    response: param.response,
                    changes_mode: entry.changes_mode,
                })
            }
            _ => Some(CommandSizes {
                name: entry.name,
                data: entry.data,
                response: entry.response,
                changes_mode: entry.changes_mode,
            }),
        }
    }

    /// One line describing the command at the start of `bytes`.
    pub fn describe(&self, bytes: &[u8]) -> String {
        let Some(&byte) = bytes.first() else {
            return String::from("empty command");
        };
        match (self.command(byte), self.lookup(bytes)) {
            (Some(entry), Some(sizes)) if sizes.name != entry.name => format!(
                "{} {} (0x{:02x}): data {}, response {}",
                entry.name, sizes.name, byte, sizes.data, sizes.response
            ),
            (_, Some(sizes)) => format!(
                "{} (0x{:02x}): data {}, response {}",
                sizes.name, byte, sizes.data, sizes.response
            ),
            (Some(entry), None) => format!("{} (0x{:02x}): unknown parameter", entry.name, byte),
            (None, None) => format!("unknown command 0x{:02x}", byte),
        }
    }
}

/// The shared catalog, built on first use.
pub fn catalog() -> &'static Catalog {
    static CATALOG: OnceLock<Catalog> = OnceLock::new();
    CATALOG.get_or_init(Catalog::build)
}

/// Highest unit address a routing byte can reach.
pub const MAX_ROUTED_ADDRESS: u8 = 30;

/// Routing byte that sends the next command to the unit at `address`:
/// `0xF0 | a` for 0 to 15, `0xE0 | (a - 16)` for 16 to 30. Higher addresses
/// cannot be routed to.
pub fn route_to_unit(address: u8) -> Option<u8> {
    match address {
        0..=15 => Some(cmd::RS232_TO_FBB | address),
        16..=MAX_ROUTED_ADDRESS => Some(cmd::RS232_TO_FBB_EXPANDED | (address - 16)),
        _ => None,
    }
}

/// Unit address a routing byte sends to, if `byte` is a routing byte.
pub fn routed_unit(byte: u8) -> Option<u8> {
    match byte & 0xf0 {
        cmd::RS232_TO_FBB => Some(byte & 0x0f),
        cmd::RS232_TO_FBB_EXPANDED => Some(16 + (byte & 0x0f)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    /// Every registered command resolves, and reserved routing bytes do not
    #[test]
    fn registered_commands_known() {
        let catalog = catalog();
        for (byte, entry) in COMMANDS {
            assert_eq!(catalog.command(*byte), Some(entry));
        }
        for address in 0..15 {
            assert!(catalog.lookup(&[route_to_unit(address).unwrap()]).is_some());
        }
        for address in 16..31 {
            assert!(catalog.lookup(&[route_to_unit(address).unwrap()]).is_some());
        }
        for master in 0x31..=0x3f {
            assert_eq!(catalog.command(master).map(|e| e.name), Some("NEXT MASTER"));
        }
        assert_eq!(catalog.command(0x30).map(|e| e.name), Some("NEXT TRANSMITTER"));
        assert_eq!(catalog.lookup(&[0xef]), None);
        assert_eq!(catalog.lookup(&[0xff]), None);
    }

    #[test]
    fn unregistered_commands_unknown() {
        let catalog = catalog();
        for byte in [0x00, 0x43, 0x55, 0x5b, 0x7b, 0x80, 0xd0] {
            assert_eq!(catalog.lookup(&[byte]), None, "byte 0x{:02x}", byte);
        }
        assert_eq!(catalog.lookup(&[]), None);
    }

    /// CHANGE VALUE carries the parameter byte plus the parameter's data
    #[test]
    fn change_value_sizes_follow_parameter() {
        let catalog = catalog();
        for (byte, entry) in PARAMETERS {
            let sizes = catalog.lookup(&[cmd::CHANGE_VALUE, *byte]);
            if !entry.changeable {
                assert_eq!(sizes, None);
                continue;
            }
            let sizes = sizes.unwrap();
            match entry.data {
                Fixed(n) => assert_eq!(sizes.data, Fixed(n + 1)),
                Variable => assert_eq!(sizes.data, Variable),
            }
            assert_eq!(sizes.changes_mode, entry.changes_mode);
            assert_eq!(sizes.response, Fixed(0));
        }
    }

    #[test]
    fn examine_value_sizes_follow_parameter() {
        let catalog = catalog();
        for (byte, entry) in PARAMETERS {
            let sizes = catalog.lookup(&[cmd::EXAMINE_VALUE, *byte]).unwrap();
            assert_eq!(sizes.response, entry.response);
            assert_eq!(sizes.data, Fixed(1));
        }
    }

    /// Parameter-dependent commands are unknown without a known parameter
    #[test]
    fn unknown_parameter_is_unknown() {
        let catalog = catalog();
        assert_eq!(catalog.lookup(&[cmd::CHANGE_VALUE]), None);
        assert_eq!(catalog.lookup(&[cmd::EXAMINE_VALUE, 0x07]), None);
        assert_eq!(catalog.lookup(&[cmd::CHANGE_VALUE, 0x99, 0x00]), None);
        assert!(catalog.command(cmd::CHANGE_VALUE).is_some());
    }

    #[test]
    fn auto_configuration_command_is_three_bytes() {
        let sizes = catalog()
            .lookup(&[cmd::CHANGE_VALUE, param::FBB_AUTO_CONFIGURATION, 2])
            .unwrap();
        assert_eq!(sizes.wire_size(), Some(3));
    }

    #[test]
    fn routing_round_trip() {
        for address in 0..31 {
            assert_eq!(routed_unit(route_to_unit(address).unwrap()), Some(address));
        }
        assert_eq!(route_to_unit(1), Some(0xf1));
        assert_eq!(route_to_unit(17), Some(0xe1));
        assert_eq!(route_to_unit(30), Some(0xee));
        assert_eq!(route_to_unit(31), None);
        assert_eq!(route_to_unit(40), None);
        assert_eq!(routed_unit(cmd::POINT), None);
    }

    /// Concurrent first use yields one shared catalog
    #[test]
    fn catalog_built_once() {
        let handles: Vec<_> = (0..8)
            .map(|_| thread::spawn(|| catalog() as *const Catalog as usize))
            .collect();
        let addrs: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(addrs.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn describe_names_parameter() {
        let text = catalog().describe(&[cmd::EXAMINE_VALUE, param::ERROR_CODE]);
        assert_eq!(text, "EXAMINE VALUE ERROR CODE (0x4f): data 1, response 1");
        assert_eq!(catalog().describe(&[0x00]), "unknown command 0x00");
    }
}
