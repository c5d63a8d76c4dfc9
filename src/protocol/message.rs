//! # Messages
//!
//! Application payloads are opaque to the transport: a [`Message`] is anything
//! that can serialize itself through a [`Stream`] and reports a small integer
//! type tag. The [`MessageFactory`] maps tags back to constructors so a receiver
//! can rebuild typed messages from a packet.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;

use crate::core::stream::{MeasureStream, Stream};
use crate::error::{NetError, Result};

/// Typed payload carried by the transport
///
/// `serialize` is called with a write, read or measure stream; the same body
/// must serve all three.
pub trait Message: Debug + 'static {
    /// Tag identifying the concrete type on the wire
    fn message_type(&self) -> u8;

    fn serialize(&mut self, stream: &mut dyn Stream) -> Result<()>;

    fn as_any(&self) -> &dyn Any;
}

impl dyn Message {
    /// Downcast to a concrete message type
    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// Bits `message` occupies when serialized, excluding its type tag
pub fn measure(message: &mut dyn Message) -> Result<usize> {
    let mut stream = MeasureStream::new();
    message.serialize(&mut stream)?;
    Ok(stream.bits_processed())
}

type Constructor = dyn Fn() -> Box<dyn Message>;

/// Registry of message constructors keyed by type tag
#[derive(Default)]
pub struct MessageFactory {
    constructors: HashMap<u8, Box<Constructor>>,
}

impl MessageFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the default-constructed form of `T` under `message_type`
    pub fn register<T>(&mut self, message_type: u8)
    where
        T: Message + Default,
    {
        self.register_with(message_type, || Box::new(T::default()));
    }

    /// Register a custom constructor, replacing any previous one for the tag
    pub fn register_with<F>(&mut self, message_type: u8, constructor: F)
    where
        F: Fn() -> Box<dyn Message> + 'static,
    {
        self.constructors.insert(message_type, Box::new(constructor));
    }

    pub fn is_registered(&self, message_type: u8) -> bool {
        self.constructors.contains_key(&message_type)
    }

    /// Blank message for `message_type`
    pub fn create(&self, message_type: u8) -> Result<Box<dyn Message>> {
        self.constructors
            .get(&message_type)
            .map(|constructor| constructor())
            .ok_or(NetError::UnknownMessageType(message_type))
    }

    /// Read a type tag off `stream`, then the message it names
    pub fn read_message(&self, stream: &mut dyn Stream) -> Result<Box<dyn Message>> {
        let mut message_type = 0u8;
        stream.serialize_byte(&mut message_type)?;
        let mut message = self.create(message_type)?;
        message.serialize(stream)?;
        Ok(message)
    }

    /// Write the type tag of `message` followed by its body
    pub fn write_message(stream: &mut dyn Stream, message: &mut dyn Message) -> Result<()> {
        let mut message_type = message.message_type();
        stream.serialize_byte(&mut message_type)?;
        message.serialize(stream)
    }
}

impl Debug for MessageFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.constructors.keys().copied().collect();
        types.sort_unstable();
        f.debug_struct("MessageFactory").field("types", &types).finish()
    }
}
