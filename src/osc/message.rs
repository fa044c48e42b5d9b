//! Building and parsing single messages and bundles.

use super::OscError;
use nom::{
    bytes::complete::{tag, take, take_till},
    combinator::map,
    number::complete::{be_f32, be_i32, be_u32, be_u64},
    sequence::preceded,
    IResult,
};

/// First character of every type tag.
pub const TAG_MARKER: char = ',';

/// Name of a bundle.
pub const BUNDLE_NAME: &str = "#bundle";

/// Length of a zero-terminated string once padded: always at least one zero
/// byte, rounded up to a multiple of four.
pub fn padded_len(len: usize) -> usize {
    (len / 4 + 1) * 4
}

fn blob_padding(len: usize) -> usize {
    (4 - len % 4) % 4
}

/// Argument types a type tag can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    /// `i`, 32 bit big-endian integer
    Int,
    /// `f`, 32 bit big-endian float
    Float,
    /// `s`, zero-terminated padded string
    Str,
    /// `b`, 32 bit length then padded bytes
    Blob,
}

impl ArgType {
    /// The type named by a type tag character.
    pub fn from_tag(tag: char) -> Option<Self> {
        match tag {
            'i' => Some(ArgType::Int),
            'f' => Some(ArgType::Float),
            's' => Some(ArgType::Str),
            'b' => Some(ArgType::Blob),
            _ => None,
        }
    }

    /// The type tag character.
    pub fn tag(self) -> char {
        match self {
            ArgType::Int => 'i',
            ArgType::Float => 'f',
            ArgType::Str => 's',
            ArgType::Blob => 'b',
        }
    }
}

/// One argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    #[allow(missing_docs)]
    Int(i32),
    #[allow(missing_docs)]
    Float(f32),
    #[allow(missing_docs)]
    Str(String),
    #[allow(missing_docs)]
    Blob(Vec<u8>),
}

impl Argument {
    /// Type of this argument.
    pub fn arg_type(&self) -> ArgType {
        match self {
            Argument::Int(_) => ArgType::Int,
            Argument::Float(_) => ArgType::Float,
            Argument::Str(_) => ArgType::Str,
            Argument::Blob(_) => ArgType::Blob,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) -> Result<(), OscError> {
        match self {
            Argument::Int(v) => out.extend_from_slice(&v.to_be_bytes()),
            Argument::Float(v) => out.extend_from_slice(&v.to_be_bytes()),
            Argument::Str(s) => put_string(out, s)?,
            Argument::Blob(data) => {
                let len = u32::try_from(data.len()).map_err(|_| OscError::InvalidString)?;
                out.extend_from_slice(&len.to_be_bytes());
                out.extend_from_slice(data);
                out.resize(out.len() + blob_padding(data.len()), 0);
            }
        }
        Ok(())
    }
}

impl From<i32> for Argument {
    fn from(v: i32) -> Self {
        Argument::Int(v)
    }
}

impl From<f32> for Argument {
    fn from(v: f32) -> Self {
        Argument::Float(v)
    }
}

impl From<&str> for Argument {
    fn from(v: &str) -> Self {
        Argument::Str(v.to_owned())
    }
}

impl From<Vec<u8>> for Argument {
    fn from(v: Vec<u8>) -> Self {
        Argument::Blob(v)
    }
}

fn put_string(out: &mut Vec<u8>, s: &str) -> Result<(), OscError> {
    if s.bytes().any(|b| b == 0) {
        return Err(OscError::InvalidString);
    }
    out.extend_from_slice(s.as_bytes());
    out.resize(out.len() + padded_len(s.len()) - s.len(), 0);
    Ok(())
}

type Parsed<'a, T> = IResult<&'a [u8], T>;

/// Parse a zero-terminated, padded string.
fn osc_string(input: &[u8]) -> Parsed<'_, &[u8]> {
    let text: Parsed<&[u8]> = take_till(|b| b == 0)(input);
    let (rest, s) = text?;
    let padding: Parsed<&[u8]> = take(padded_len(s.len()) - s.len())(rest);
    let (rest, _) = padding?;
    Ok((rest, s))
}

/// Parse a length-prefixed, padded blob.
fn osc_blob(input: &[u8]) -> Parsed<'_, &[u8]> {
    let len: Parsed<u32> = be_u32(input);
    let (rest, len) = len?;
    let len = len as usize;
    let data: Parsed<&[u8]> = take(len)(rest);
    let (rest, data) = data?;
    let padding: Parsed<&[u8]> = take(blob_padding(len))(rest);
    let (rest, _) = padding?;
    Ok((rest, data))
}

fn argument(arg_type: ArgType, input: &[u8]) -> Parsed<'_, Argument> {
    match arg_type {
        ArgType::Int => map(be_i32, Argument::Int)(input),
        ArgType::Float => map(be_f32, Argument::Float)(input),
        ArgType::Str => map(osc_string, |s: &[u8]| {
            Argument::Str(String::from_utf8_lossy(s).into_owned())
        })(input),
        ArgType::Blob => map(osc_blob, |b: &[u8]| Argument::Blob(b.to_vec()))(input),
    }
}

fn arg_types(type_tag: &str) -> Result<Vec<ArgType>, OscError> {
    let mut chars = type_tag.chars();
    if chars.next() != Some(TAG_MARKER) {
        return Err(OscError::MissingTagMarker);
    }
    chars
        .map(|c| ArgType::from_tag(c).ok_or(OscError::UnknownType(c)))
        .collect()
}

/// Decode the argument section of a message with the given type tag.
/// Returns the arguments and how many bytes they took.
fn parse_arguments(type_tag: &str, bytes: &[u8]) -> Result<(Vec<Argument>, usize), OscError> {
    let types = arg_types(type_tag)?;
    let mut input = bytes;
    let mut args = Vec::with_capacity(types.len());
    for arg_type in types {
        let (rest, arg) = argument(arg_type, input).map_err(|_| OscError::IncompleteArguments)?;
        args.push(arg);
        input = rest;
    }
    Ok((args, bytes.len() - input.len()))
}

/// Decode the arguments a method receives, given its type tag.
pub fn decode_arguments(type_tag: &str, bytes: &[u8]) -> Result<Vec<Argument>, OscError> {
    parse_arguments(type_tag, bytes).map(|(args, _)| args)
}

fn utf8(bytes: &[u8]) -> Result<&str, OscError> {
    std::str::from_utf8(bytes).map_err(|_| OscError::InvalidString)
}

/// A message parsed in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MessageRef<'a> {
    pub name: &'a str,
    pub type_tag: &'a str,
    pub arguments: &'a [u8],
}

/// Parse one (non-bundle) message at the start of `buffer`.
pub(crate) fn parse_leaf(buffer: &[u8]) -> Result<MessageRef<'_>, OscError> {
    let (rest, name) = osc_string(buffer).map_err(|_| {
        if buffer.contains(&0) {
            OscError::MissingTypeTag
        } else {
            OscError::Unterminated
        }
    })?;
    if rest.first() != Some(&(TAG_MARKER as u8)) {
        return Err(OscError::MissingTypeTag);
    }
    let (rest, type_tag) = osc_string(rest).map_err(|_| OscError::IncompleteTypeTag)?;
    let (name, type_tag) = (utf8(name)?, utf8(type_tag)?);

    let (_, args_len) = parse_arguments(type_tag, rest)?;
    Ok(MessageRef {
        name,
        type_tag,
        arguments: &rest[..args_len],
    })
}

/// Whether `buffer` holds a bundle rather than a single message.
pub(crate) fn is_bundle(buffer: &[u8]) -> bool {
    buffer.starts_with(b"#bundle\0")
}

/// Bundle name and time tag.
fn bundle_header(input: &[u8]) -> Parsed<'_, u64> {
    preceded(tag(&b"#bundle\0"[..]), be_u64)(input)
}

/// One length-prefixed bundle element.
fn bundle_element(input: &[u8]) -> Parsed<'_, &[u8]> {
    let len: Parsed<u32> = be_u32(input);
    let (rest, len) = len?;
    take(len)(rest)
}

/// Split a bundle into its elements. Fails, without returning any element,
/// if one of them claims more bytes than remain.
pub(crate) fn bundle_elements(buffer: &[u8]) -> Result<(u64, Vec<&[u8]>), OscError> {
    let (mut rest, time_tag) = bundle_header(buffer).map_err(|_| OscError::IncompleteBundle)?;

    let mut elements = Vec::new();
    while !rest.is_empty() {
        let (next, element) = bundle_element(rest).map_err(|_| OscError::IncompleteBundle)?;
        elements.push(element);
        rest = next;
    }
    Ok((time_tag, elements))
}

/// A complete message, built for sending or copied out of a packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    name: String,
    type_tag: String,
    arguments: Vec<u8>,
}

impl Message {
    /// Build a message. `type_tag` must start with `,` and name the type
    /// of every element of `args`, in order.
    pub fn build(name: &str, type_tag: &str, args: &[Argument]) -> Result<Self, OscError> {
        let types = arg_types(type_tag)?;
        if types.len() != args.len() {
            return Err(OscError::ArgumentCount {
                expected: types.len(),
                actual: args.len(),
            });
        }
        if name.bytes().any(|b| b == 0) {
            return Err(OscError::InvalidString);
        }

        let mut arguments = Vec::new();
        for (index, (arg_type, arg)) in types.iter().zip(args).enumerate() {
            if arg.arg_type() != *arg_type {
                return Err(OscError::ArgumentMismatch {
                    index,
                    expected: arg_type.tag(),
                });
            }
            arg.encode(&mut arguments)?;
        }

        Ok(Message {
            name: name.to_owned(),
            type_tag: type_tag.to_owned(),
            arguments,
        })
    }

    /// Parse a single message out of `buffer`.
    pub fn parse(buffer: &[u8]) -> Result<Self, OscError> {
        let leaf = parse_leaf(buffer)?;
        Ok(Message {
            name: leaf.name.to_owned(),
            type_tag: leaf.type_tag.to_owned(),
            arguments: leaf.arguments.to_vec(),
        })
    }

    #[allow(missing_docs)]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[allow(missing_docs)]
    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    /// The encoded argument section.
    pub fn arguments(&self) -> &[u8] {
        &self.arguments
    }

    /// Decoded argument values.
    pub fn decode_arguments(&self) -> Result<Vec<Argument>, OscError> {
        decode_arguments(&self.type_tag, &self.arguments)
    }

    /// Encoded size.
    pub fn len(&self) -> usize {
        padded_len(self.name.len()) + padded_len(self.type_tag.len()) + self.arguments.len()
    }

    /// Never true: a message always has at least its padded name.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// The message on the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        // Both were checked for zero bytes when the message was made.
        for s in [&self.name, &self.type_tag] {
            out.extend_from_slice(s.as_bytes());
            out.resize(out.len() + padded_len(s.len()) - s.len(), 0);
        }
        out.extend_from_slice(&self.arguments);
        out
    }
}

/// Messages sent together under one time tag.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Bundle {
    /// NTP-style time tag; 1 means "immediately".
    pub time_tag: u64,
    /// The contained messages, in order
    pub messages: Vec<Message>,
}

impl Bundle {
    /// An empty bundle to be processed immediately.
    pub fn immediate() -> Self {
        Bundle {
            time_tag: 1,
            messages: Vec::new(),
        }
    }

    /// Add a message.
    pub fn push(&mut self, message: Message) -> &mut Self {
        self.messages.push(message);
        self
    }

    /// The bundle on the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = b"#bundle\0".to_vec();
        out.extend_from_slice(&self.time_tag.to_be_bytes());
        for message in &self.messages {
            let bytes = message.to_bytes();
            out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
            out.extend_from_slice(&bytes);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding() {
        assert_eq!(padded_len(0), 4);
        assert_eq!(padded_len(3), 4);
        assert_eq!(padded_len(4), 8);
        assert_eq!(padded_len(7), 8);
    }

    #[test]
    fn build_layout() {
        let msg =
            Message::build("bird1", ",if", &[Argument::Int(-2), Argument::Float(1.5)]).unwrap();
        assert_eq!(
            msg.to_bytes(),
            vec![
                b'b', b'i', b'r', b'd', b'1', 0, 0, 0, //
                b',', b'i', b'f', 0, //
                0xff, 0xff, 0xff, 0xfe, //
                0x3f, 0xc0, 0x00, 0x00,
            ]
        );
        assert_eq!(msg.len(), 20);
    }

    #[test]
    fn build_rejects_bad_type_tags() {
        assert_eq!(
            Message::build("x", "if", &[Argument::Int(1)]),
            Err(OscError::MissingTagMarker)
        );
        assert_eq!(
            Message::build("x", ",q", &[Argument::Int(1)]),
            Err(OscError::UnknownType('q'))
        );
        assert_eq!(
            Message::build("x", ",i", &[Argument::Float(1.0)]),
            Err(OscError::ArgumentMismatch {
                index: 0,
                expected: 'i'
            })
        );
        assert_eq!(
            Message::build("x", ",ii", &[Argument::Int(1)]),
            Err(OscError::ArgumentCount {
                expected: 2,
                actual: 1
            })
        );
        assert_eq!(
            Message::build("x", ",s", &["a\0b".into()]),
            Err(OscError::InvalidString)
        );
    }

    #[test]
    fn parse_round_trip_values() {
        let args = vec![
            Argument::Str("bump".into()),
            Argument::Float(0.25),
            Argument::Blob(vec![1, 2, 3, 4, 5]),
            Argument::Int(7),
        ];
        let msg = Message::build("bird2", ",sfbi", &args).unwrap();
        let parsed = Message::parse(&msg.to_bytes()).unwrap();
        assert_eq!(parsed, msg);
        assert_eq!(parsed.decode_arguments().unwrap(), args);
    }

    #[test]
    fn parse_rejects_malformed() {
        assert_eq!(Message::parse(b"abc"), Err(OscError::Unterminated));
        assert_eq!(Message::parse(b"abc\0xif\0"), Err(OscError::MissingTypeTag));
        assert_eq!(Message::parse(b"abc\0,if"), Err(OscError::IncompleteTypeTag));
        assert_eq!(
            Message::parse(b"abc\0,i\0\0\0\0"),
            Err(OscError::IncompleteArguments)
        );
        assert_eq!(
            Message::parse(b"abc\0,x\0\0"),
            Err(OscError::UnknownType('x'))
        );
    }

    #[test]
    fn bundle_layout() {
        let mut bundle = Bundle::immediate();
        bundle.push(Message::build("a", ",", &[]).unwrap());
        let bytes = bundle.to_bytes();
        assert!(is_bundle(&bytes));
        assert_eq!(&bytes[8..16], &[0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(&bytes[16..20], &[0, 0, 0, 8]);

        let (time_tag, elements) = bundle_elements(&bytes).unwrap();
        assert_eq!(time_tag, 1);
        assert_eq!(elements, vec![&b"a\0\0\0,\0\0\0"[..]]);
    }

    /// A length prefix cut short is as incomplete as a short element
    #[test]
    fn bundle_with_partial_length() {
        let mut bundle = Bundle::immediate();
        bundle.push(Message::build("a", ",", &[]).unwrap());
        let mut bytes = bundle.to_bytes();
        bytes.extend_from_slice(&[0, 0]);
        assert_eq!(bundle_elements(&bytes), Err(OscError::IncompleteBundle));
        assert_eq!(bundle_elements(b"#bundle\0\0\0"), Err(OscError::IncompleteBundle));
    }

    #[test]
    fn leaf_arguments_are_exact() {
        let msg = Message::build("zthreshold", ",f", &[Argument::Float(0.5)]).unwrap();
        let mut bytes = msg.to_bytes();
        bytes.extend_from_slice(&[9, 9, 9, 9]);

        let leaf = parse_leaf(&bytes).unwrap();
        assert_eq!(leaf.name, "zthreshold");
        assert_eq!(leaf.type_tag, ",f");
        assert_eq!(leaf.arguments, &0.5f32.to_be_bytes()[..]);
        assert_eq!(parse_leaf(b"abc\0"), Err(OscError::MissingTypeTag));
    }

    #[test]
    fn truncated_bundle_yields_nothing() {
        let mut bundle = Bundle::immediate();
        bundle.push(Message::build("a", ",i", &[Argument::Int(1)]).unwrap());
        bundle.push(Message::build("b", ",i", &[Argument::Int(2)]).unwrap());
        let bytes = bundle.to_bytes();
        assert_eq!(
            bundle_elements(&bytes[..bytes.len() - 2]),
            Err(OscError::IncompleteBundle)
        );
    }
}
