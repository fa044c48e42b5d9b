//! Errors shared by the tracker sessions.
//!
//! Every fallible session call returns a [FlockError]. The bus session also
//! keeps the most specific [ErrorCode] it has seen, which a caller can read
//! (and clear) after a call failed or a status check reported a device fault.

use log::warn;
use std::{borrow::Cow, fmt, io};

/// Error returned by the bus and stream sessions.
#[derive(Debug)]
pub enum FlockError {
    /// The device path could not be opened.
    Open(io::Error),

    /// Reading the terminal settings of the device failed.
    GetAttributes(io::Error),

    /// Applying raw terminal settings to the device failed.
    SetAttributes(io::Error),

    /// A read, write or wait on the device failed.
    Io(io::Error),

    /// The USB transport reported an error.
    Usb(rusb::Error),

    /// No USB device with this vendor and product id is attached.
    DeviceNotFound {
        /// USB vendor id searched for
        vendor_id: u16,
        /// USB product id searched for
        product_id: u16,
    },

    /// A unit address outside `1..=unit_count`.
    InvalidUnit(usize),

    /// A session needs at least one unit, and no more than the bus allows.
    InvalidUnitCount(usize),

    /// A record buffer that is shorter than its record mode requires.
    InvalidSize {
        /// Bytes required by the record mode
        expected: usize,
        /// Bytes actually supplied
        actual: usize,
    },

    /// The flock did not answer the system status query at all.
    NoStatus,

    /// A unit did not answer a status query.
    NoResponse {
        /// Unit that stayed silent
        unit: usize,
        /// What was being asked
        query: &'static str,
    },

    /// Stream mode was requested without group mode.
    NotInGroupMode,

    /// The first byte of a bus record did not carry the phase bit.
    PhaseBit {
        /// Address of the unit the record belongs to
        address: u8,
    },

    /// The high-speed tracker never answered the wake-up handshake.
    Handshake,
}

impl fmt::Display for FlockError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use FlockError as FE;
        let msg = match self {
            FE::Open(error) => Cow::from(format!("cannot open device: {}", error)),
            FE::GetAttributes(error) => {
                Cow::from(format!("cannot get terminal attributes: {}", error))
            }
            FE::SetAttributes(error) => {
                Cow::from(format!("cannot set terminal attributes: {}", error))
            }
            FE::Io(error) => Cow::from(format!("system call error: {}", error)),
            FE::Usb(error) => Cow::from(format!("usb error: {}", error)),
            FE::DeviceNotFound {
                vendor_id,
                product_id,
            } => Cow::from(format!(
                "no usb device {:04x}:{:04x} attached",
                vendor_id, product_id
            )),
            FE::InvalidUnit(unit) => Cow::from(format!("invalid unit address {}", unit)),
            FE::InvalidUnitCount(count) => Cow::from(format!("invalid unit count {}", count)),
            FE::InvalidSize { expected, actual } => Cow::from(format!(
                "record needs {} bytes but only {} were given",
                expected, actual
            )),
            FE::NoStatus => Cow::from("no flock system status, are the birds flying?"),
            FE::NoResponse { unit, query } => {
                Cow::from(format!("no response to {} from unit {}", query, unit))
            }
            FE::NotInGroupMode => Cow::from("stream mode requires group mode"),
            FE::PhaseBit { address } => {
                Cow::from(format!("missing phase bit in record from unit {}", address))
            }
            FE::Handshake => Cow::from("tracker did not answer the handshake"),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for FlockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FlockError::Open(error)
            | FlockError::GetAttributes(error)
            | FlockError::SetAttributes(error)
            | FlockError::Io(error) => Some(error),
            FlockError::Usb(error) => Some(error),
            _ => None,
        }
    }
}

impl From<io::Error> for FlockError {
    fn from(error: io::Error) -> Self {
        FlockError::Io(error)
    }
}

impl From<rusb::Error> for FlockError {
    fn from(error: rusb::Error) -> Self {
        FlockError::Usb(error)
    }
}

/// Device error code that the flock reports as harmless.
pub const CPU_TIME_OVERFLOW: u8 = 31;

const DEVICE_ERRORS: [&str; 36] = [
    "no error",
    "ram failure",
    "non-volatile storage write failure",
    "PCB configuration data corrupt",
    "transmitter configuration data corrupt",
    "sensor configuration data corrupt",
    "invalid RS232 command",
    "not an FBB master",
    "no birds accessible in device list",
    "bird is not initialized",
    "FBB receive error - intra bird bus",
    "RS232 receive overrun on framing error",
    "FBB receive error - FBB host bus",
    "no FBB command response",
    "invalid FBB host command",
    "FBB run time error",
    "invalid CPU speed",
    "no data error",
    "illegal baud rate error",
    "slave acknowledge error",
    "unused_INT4",
    "unused_INT5",
    "unused_INT6",
    "unused_INT7",
    "unused_INT9",
    "unused_INT10",
    "unused_INT11",
    "unused_INT16",
    "CRT synchronization error",
    "transmitter not accessible error",
    "extended range transmitter not attached error",
    "CPU time overflow error",
    "sensor saturated error",
    "slave configuration error",
    "watch dog error",
    "over temperature error",
];

/// The most specific error a bus session has seen since it was last asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorCode {
    /// Nothing went wrong.
    #[default]
    NoError,
    /// An error code reported by a unit (parameter ERROR CODE).
    Device(u8),
    /// A read, write or wait on the device failed.
    SystemCall,
    /// An unknown command, parameter or unsupported request.
    Unimplemented,
}

impl ErrorCode {
    /// Human-readable description. Unknown device codes read as "no error",
    /// the same as the device's own table does.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorCode::NoError => DEVICE_ERRORS[0],
            ErrorCode::Device(code) => match DEVICE_ERRORS.get(usize::from(*code)) {
                Some(text) => text,
                None => {
                    warn!("unknown device error code {}", code);
                    DEVICE_ERRORS[0]
                }
            },
            ErrorCode::SystemCall => "system call error",
            ErrorCode::Unimplemented => "unimplemented error",
        }
    }

    /// True for codes that should not be treated as a failure.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            ErrorCode::NoError | ErrorCode::Device(0) | ErrorCode::Device(CPU_TIME_OVERFLOW)
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}
