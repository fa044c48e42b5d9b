//! Dispatching incoming packets to registered methods.

use super::{
    message::{bundle_elements, is_bundle, parse_leaf},
    OscError,
};
use log::{debug, trace};

/// Something that can be called with the encoded arguments of a matching
/// message.
pub trait Method: Send {
    /// Handle one message. `arguments` is exactly the argument section the
    /// message's type tag describes; decode it with
    /// [decode_arguments](super::decode_arguments).
    fn invoke(&mut self, arguments: &[u8]) -> Result<(), OscError>;
}

impl<F> Method for F
where
    F: FnMut(&[u8]) -> Result<(), OscError> + Send,
{
    fn invoke(&mut self, arguments: &[u8]) -> Result<(), OscError> {
        self(arguments)
    }
}

struct Entry {
    name: String,
    type_tag: String,
    method: Box<dyn Method>,
}

/// Methods keyed by message name and type tag.
#[derive(Default)]
pub struct MethodRegistry {
    entries: Vec<Entry>,
}

impl MethodRegistry {
    #[allow(missing_docs)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `method` for messages named `name` with type tag `type_tag`.
    /// Only one method per name and type tag.
    pub fn register<M>(&mut self, name: &str, type_tag: &str, method: M) -> Result<(), OscError>
    where
        M: Method + 'static,
    {
        if !type_tag.starts_with(',') {
            return Err(OscError::MissingTagMarker);
        }
        if self.contains(name, type_tag) {
            return Err(OscError::DuplicateMethod {
                name: name.to_owned(),
                type_tag: type_tag.to_owned(),
            });
        }
        self.entries.push(Entry {
            name: name.to_owned(),
            type_tag: type_tag.to_owned(),
            method: Box::new(method),
        });
        Ok(())
    }

    /// Whether a method is registered for this name and type tag.
    pub fn contains(&self, name: &str, type_tag: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.name == name && e.type_tag == type_tag)
    }

    #[allow(missing_docs)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse `packet`, a single message or a bundle, and call the method
    /// registered for each message in it. The slice bounds the packet; no
    /// byte past its end is read.
    ///
    /// Returns how many methods were called. A message nobody registered
    /// for is skipped. A malformed packet is an error, and a bundle with a
    /// truncated element calls nothing.
    pub fn dispatch(&mut self, packet: &[u8]) -> Result<usize, OscError> {
        if !packet.contains(&0) {
            return Err(OscError::Unterminated);
        }

        if is_bundle(packet) {
            let (time_tag, elements) = bundle_elements(packet)?;
            trace!("bundle at {:#x} with {} elements", time_tag, elements.len());
            let mut called = 0;
            for element in elements {
                called += self.dispatch(element)?;
            }
            return Ok(called);
        }

        let message = parse_leaf(packet)?;
        match self
            .entries
            .iter_mut()
            .find(|e| e.name == message.name && e.type_tag == message.type_tag)
        {
            Some(entry) => {
                entry.method.invoke(message.arguments)?;
                Ok(1)
            }
            None => {
                debug!("no method for {} {}", message.name, message.type_tag);
                Ok(0)
            }
        }
    }
}
