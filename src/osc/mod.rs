//! A small OSC-style message codec.
//!
//! A message is a name, a type tag (`,` followed by one character per
//! argument) and the arguments in network byte order, with the name and
//! type tag each padded with zeros to a multiple of four bytes. Several
//! messages can travel together in a `#bundle`.
//!
//! Outgoing messages are built with [Message::build]; incoming packets are
//! handed to a [MethodRegistry], which calls the method registered for the
//! exact name and type tag.

pub mod message;
pub mod registry;

pub use message::{decode_arguments, ArgType, Argument, Bundle, Message};
pub use registry::{Method, MethodRegistry};

use std::{borrow::Cow, fmt};

/// Things that go wrong building, parsing or dispatching messages.
#[derive(Debug, Clone, PartialEq)]
pub enum OscError {
    /// The type tag does not start with `,`.
    MissingTagMarker,

    /// A type tag character with no registered argument type.
    UnknownType(char),

    /// The type tag and the argument list disagree on the argument count.
    ArgumentCount {
        #[allow(missing_docs)]
        expected: usize,
        #[allow(missing_docs)]
        actual: usize,
    },

    /// An argument does not have the type its type tag character says.
    ArgumentMismatch {
        /// Position of the argument
        index: usize,
        /// Type tag character at that position
        expected: char,
    },

    /// A name or string argument that contains a zero byte or is not UTF-8.
    InvalidString,

    /// No terminating zero byte inside the buffer.
    Unterminated,

    /// The padded name is not followed by a type tag.
    MissingTypeTag,

    /// The type tag is not terminated or padded inside the buffer.
    IncompleteTypeTag,

    /// The buffer ends before the arguments the type tag announces.
    IncompleteArguments,

    /// A bundle element claims more bytes than the bundle holds.
    IncompleteBundle,

    /// A method is already registered for this name and type tag.
    DuplicateMethod {
        #[allow(missing_docs)]
        name: String,
        #[allow(missing_docs)]
        type_tag: String,
    },

    /// A method reported a failure.
    Handler(String),
}

impl fmt::Display for OscError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use OscError as OE;
        let msg = match self {
            OE::MissingTagMarker => Cow::from("type tag does not start with ','"),
            OE::UnknownType(c) => Cow::from(format!("unknown argument type '{}'", c)),
            OE::ArgumentCount { expected, actual } => Cow::from(format!(
                "type tag announces {} arguments, got {}",
                expected, actual
            )),
            OE::ArgumentMismatch { index, expected } => Cow::from(format!(
                "argument {} is not of type '{}'",
                index, expected
            )),
            OE::InvalidString => Cow::from("invalid string"),
            OE::Unterminated => Cow::from("incomplete message"),
            OE::MissingTypeTag => Cow::from("no type tag after message name"),
            OE::IncompleteTypeTag => Cow::from("incomplete type tag"),
            OE::IncompleteArguments => Cow::from("incomplete arguments"),
            OE::IncompleteBundle => Cow::from("incomplete bundle element"),
            OE::DuplicateMethod { name, type_tag } => Cow::from(format!(
                "method {} {} is already registered",
                name, type_tag
            )),
            OE::Handler(reason) => Cow::from(format!("method failed: {}", reason)),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for OscError {}
