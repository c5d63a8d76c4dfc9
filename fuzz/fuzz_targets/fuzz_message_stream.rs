#![no_main]

use drudgenet::core::stream::{ReadStream, Stream};
use drudgenet::error::Result;
use drudgenet::protocol::message::{Message, MessageFactory};
use libfuzzer_sys::fuzz_target;
use std::any::Any;

#[derive(Debug, Default)]
struct Probe {
    id: i32,
    name: String,
    flags: [bool; 3],
}

impl Message for Probe {
    fn message_type(&self) -> u8 {
        1
    }

    fn serialize(&mut self, stream: &mut dyn Stream) -> Result<()> {
        stream.serialize_integer(&mut self.id, -5, 900)?;
        stream.serialize_string(&mut self.name)?;
        for flag in &mut self.flags {
            stream.serialize_bool(flag)?;
        }
        stream.checkpoint()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes read as a run of messages must fail cleanly
    let mut factory = MessageFactory::new();
    factory.register::<Probe>(1);
    let mut stream = ReadStream::new(data);
    while stream.bits_remaining() >= 8 {
        if factory.read_message(&mut stream).is_err() {
            break;
        }
    }
});
