//! # Streams
//!
//! One serialization contract, three implementations.
//!
//! Every `serialize_*` call takes the value by `&mut`: a [`WriteStream`] reads it
//! and packs bits, a [`ReadStream`] unpacks bits and stores into it, and a
//! [`MeasureStream`] only counts how many bits the call would cost. A single
//! `serialize(&mut self, stream: &mut dyn Stream)` body therefore writes, reads
//! and measures with the same code.
//!
//! ## Encodings
//! - integers are range-compressed to `ceil(log2(max - min + 1))` bits
//! - booleans cost one bit, bytes 8, shorts 16
//! - floats and doubles are full width unless the compressed variant is used
//! - strings are a one-byte length (below 256) followed by raw UTF-8 bytes
//!
//! ## Fragility
//! Reads must mirror writes call for call. A mismatched order silently corrupts
//! every later field; [`Stream::checkpoint`] writes a magic value that the reader
//! verifies, turning such a desynchronization into an explicit error.

use crate::core::bitpacker::{bits_required, BitReader, BitWriter};
use crate::error::{NetError, Result};

/// Magic value written by [`Stream::checkpoint`]
pub const CHECKPOINT_MAGIC: u32 = 0x5AFE_C0DE;

/// Longest string [`Stream::serialize_string`] accepts
pub const MAX_STRING_LENGTH: usize = 255;

/// Journal record of one stream operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub label: &'static str,
    pub bit_offset: usize,
    pub bits: usize,
}

/// Serialization contract shared by the write, read and measure streams
pub trait Stream {
    fn is_writing(&self) -> bool;

    fn is_reading(&self) -> bool;

    /// Raw bit field, `bits` in `0..=32`
    fn serialize_bits(&mut self, value: &mut u32, bits: u32) -> Result<()>;

    /// Whole bytes, length fixed by the slice
    fn serialize_bytes(&mut self, data: &mut [u8]) -> Result<()>;

    /// Zero padding up to the next byte boundary
    fn pad_to_nearest_byte(&mut self) -> Result<()>;

    /// Bits consumed so far (written, read, or counted)
    fn bits_processed(&self) -> usize;

    /// Turn on journaling of subsequent operations
    fn enable_journal(&mut self);

    /// Journal collected since [`Stream::enable_journal`]
    fn journal(&self) -> &[JournalEntry];

    #[doc(hidden)]
    fn record(&mut self, label: &'static str, bit_offset: usize);

    /// Integer in the closed range `[min, max]`
    fn serialize_integer(&mut self, value: &mut i32, min: i32, max: i32) -> Result<()> {
        debug_assert!(min <= max);
        let start = self.bits_processed();
        let bits = bits_required(i64::from(min), i64::from(max));
        if self.is_writing() && (*value < min || *value > max) {
            return Err(NetError::ValueOutOfRange {
                value: i64::from(*value),
                min: i64::from(min),
                max: i64::from(max),
            });
        }
        let mut unsigned = (i64::from(*value) - i64::from(min)) as u32;
        self.serialize_bits(&mut unsigned, bits)?;
        if self.is_reading() {
            let decoded = i64::from(min) + i64::from(unsigned);
            if decoded > i64::from(max) {
                return Err(NetError::ValueOutOfRange {
                    value: decoded,
                    min: i64::from(min),
                    max: i64::from(max),
                });
            }
            *value = decoded as i32;
        }
        self.record("integer", start);
        Ok(())
    }

    fn serialize_bool(&mut self, value: &mut bool) -> Result<()> {
        let mut bit = u32::from(*value);
        self.serialize_bits(&mut bit, 1)?;
        *value = bit != 0;
        Ok(())
    }

    fn serialize_byte(&mut self, value: &mut u8) -> Result<()> {
        let mut wide = u32::from(*value);
        self.serialize_bits(&mut wide, 8)?;
        *value = wide as u8;
        Ok(())
    }

    fn serialize_short(&mut self, value: &mut u16) -> Result<()> {
        let mut wide = u32::from(*value);
        self.serialize_bits(&mut wide, 16)?;
        *value = wide as u16;
        Ok(())
    }

    fn serialize_u32(&mut self, value: &mut u32) -> Result<()> {
        self.serialize_bits(value, 32)
    }

    fn serialize_float(&mut self, value: &mut f32) -> Result<()> {
        let mut bits = value.to_bits();
        self.serialize_bits(&mut bits, 32)?;
        *value = f32::from_bits(bits);
        Ok(())
    }

    fn serialize_double(&mut self, value: &mut f64) -> Result<()> {
        let raw = value.to_bits();
        let mut high = (raw >> 32) as u32;
        let mut low = raw as u32;
        self.serialize_bits(&mut high, 32)?;
        self.serialize_bits(&mut low, 32)?;
        *value = f64::from_bits((u64::from(high) << 32) | u64::from(low));
        Ok(())
    }

    /// Float in `[min, max]` quantized to `resolution`
    ///
    /// Written values are clamped into range first.
    fn serialize_compressed_float(
        &mut self,
        value: &mut f32,
        min: f32,
        max: f32,
        resolution: f32,
    ) -> Result<()> {
        debug_assert!(max > min && resolution > 0.0);
        let delta = max - min;
        let steps = (delta / resolution).ceil().max(1.0) as u32;
        let bits = bits_required(0, i64::from(steps));
        let mut quantized = if self.is_writing() {
            let normalized = ((*value - min) / delta).clamp(0.0, 1.0);
            (normalized * steps as f32 + 0.5).floor() as u32
        } else {
            0
        };
        self.serialize_bits(&mut quantized, bits)?;
        if self.is_reading() {
            *value = min + (quantized.min(steps) as f32 / steps as f32) * delta;
        }
        Ok(())
    }

    /// One-byte length prefix followed by the raw string bytes
    fn serialize_string(&mut self, value: &mut String) -> Result<()> {
        let start = self.bits_processed();
        if self.is_writing() && value.len() > MAX_STRING_LENGTH {
            return Err(NetError::StringTooLong(value.len()));
        }
        let mut length = value.len() as u8;
        self.serialize_byte(&mut length)?;
        if self.is_reading() {
            let mut raw = vec![0u8; usize::from(length)];
            self.serialize_bytes(&mut raw)?;
            *value = String::from_utf8(raw).map_err(|_| NetError::InvalidUtf8)?;
        } else {
            let mut raw = value.clone().into_bytes();
            self.serialize_bytes(&mut raw)?;
        }
        self.record("string", start);
        Ok(())
    }

    /// Write (or verify on read) the checkpoint magic
    fn checkpoint(&mut self) -> Result<()> {
        let start = self.bits_processed();
        let mut magic = CHECKPOINT_MAGIC;
        self.serialize_bits(&mut magic, 32)?;
        if self.is_reading() && magic != CHECKPOINT_MAGIC {
            return Err(NetError::CheckpointMismatch {
                expected: CHECKPOINT_MAGIC,
                found: magic,
                bit: start,
            });
        }
        self.record("checkpoint", start);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Journal {
    enabled: bool,
    entries: Vec<JournalEntry>,
}

impl Journal {
    fn record(&mut self, label: &'static str, bit_offset: usize, now: usize) {
        if self.enabled {
            self.entries.push(JournalEntry {
                label,
                bit_offset,
                bits: now - bit_offset,
            });
        }
    }
}

/// Stream that packs values into a bounded buffer
#[derive(Debug)]
pub struct WriteStream {
    writer: BitWriter,
    journal: Journal,
}

impl WriteStream {
    /// Stream able to hold `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            writer: BitWriter::with_capacity(capacity),
            journal: Journal::default(),
        }
    }

    pub fn bytes_written(&self) -> usize {
        self.writer.bytes_written()
    }

    pub fn bits_available(&self) -> usize {
        self.writer.bits_available()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.writer.as_bytes()
    }

    /// Finish writing, returning the bytes written (final byte zero-padded)
    pub fn into_bytes(self) -> Vec<u8> {
        self.writer.into_bytes()
    }
}

impl Stream for WriteStream {
    fn is_writing(&self) -> bool {
        true
    }

    fn is_reading(&self) -> bool {
        false
    }

    fn serialize_bits(&mut self, value: &mut u32, bits: u32) -> Result<()> {
        self.writer.write_bits(*value, bits)
    }

    fn serialize_bytes(&mut self, data: &mut [u8]) -> Result<()> {
        self.writer.write_bytes(data)
    }

    fn pad_to_nearest_byte(&mut self) -> Result<()> {
        self.writer.align()
    }

    fn bits_processed(&self) -> usize {
        self.writer.bits_written()
    }

    fn enable_journal(&mut self) {
        self.journal.enabled = true;
    }

    fn journal(&self) -> &[JournalEntry] {
        &self.journal.entries
    }

    fn record(&mut self, label: &'static str, bit_offset: usize) {
        let now = self.writer.bits_written();
        self.journal.record(label, bit_offset, now);
    }
}

/// Stream that unpacks values from a byte slice
#[derive(Debug)]
pub struct ReadStream<'a> {
    reader: BitReader<'a>,
    journal: Journal,
}

impl<'a> ReadStream<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            reader: BitReader::new(data),
            journal: Journal::default(),
        }
    }

    pub fn bits_remaining(&self) -> usize {
        self.reader.bits_remaining()
    }

    /// Unread bytes from the next byte boundary onwards
    pub fn remaining_bytes(&self) -> &'a [u8] {
        self.reader.remaining_bytes()
    }
}

impl Stream for ReadStream<'_> {
    fn is_writing(&self) -> bool {
        false
    }

    fn is_reading(&self) -> bool {
        true
    }

    fn serialize_bits(&mut self, value: &mut u32, bits: u32) -> Result<()> {
        *value = self.reader.read_bits(bits)?;
        Ok(())
    }

    fn serialize_bytes(&mut self, data: &mut [u8]) -> Result<()> {
        self.reader.read_bytes(data)
    }

    fn pad_to_nearest_byte(&mut self) -> Result<()> {
        self.reader.align()
    }

    fn bits_processed(&self) -> usize {
        self.reader.bits_read()
    }

    fn enable_journal(&mut self) {
        self.journal.enabled = true;
    }

    fn journal(&self) -> &[JournalEntry] {
        &self.journal.entries
    }

    fn record(&mut self, label: &'static str, bit_offset: usize) {
        let now = self.reader.bits_read();
        self.journal.record(label, bit_offset, now);
    }
}

/// Stream that only counts bits
#[derive(Debug, Default)]
pub struct MeasureStream {
    bits: usize,
    journal: Journal,
}

impl MeasureStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes needed to hold everything measured so far
    pub fn bytes_required(&self) -> usize {
        self.bits.div_ceil(8)
    }
}

impl Stream for MeasureStream {
    fn is_writing(&self) -> bool {
        false
    }

    fn is_reading(&self) -> bool {
        false
    }

    fn serialize_bits(&mut self, _value: &mut u32, bits: u32) -> Result<()> {
        self.bits += bits as usize;
        Ok(())
    }

    fn serialize_bytes(&mut self, data: &mut [u8]) -> Result<()> {
        self.bits += data.len() * 8;
        Ok(())
    }

    fn pad_to_nearest_byte(&mut self) -> Result<()> {
        self.bits = self.bits.div_ceil(8) * 8;
        Ok(())
    }

    fn bits_processed(&self) -> usize {
        self.bits
    }

    fn enable_journal(&mut self) {
        self.journal.enabled = true;
    }

    fn journal(&self) -> &[JournalEntry] {
        &self.journal.entries
    }

    fn record(&mut self, label: &'static str, bit_offset: usize) {
        let now = self.bits;
        self.journal.record(label, bit_offset, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq)]
    struct Sample {
        health: i32,
        alive: bool,
        name: String,
        speed: f32,
        angle: f32,
        score: f64,
    }

    impl Sample {
        fn serialize(&mut self, stream: &mut dyn Stream) -> Result<()> {
            stream.serialize_integer(&mut self.health, -100, 100)?;
            stream.serialize_bool(&mut self.alive)?;
            stream.serialize_string(&mut self.name)?;
            stream.checkpoint()?;
            stream.serialize_float(&mut self.speed)?;
            stream.serialize_compressed_float(&mut self.angle, 0.0, 360.0, 0.5)?;
            stream.serialize_double(&mut self.score)
        }
    }

    #[test]
    fn test_write_read_measure_agree() {
        let mut original = Sample {
            health: -42,
            alive: true,
            name: "drudge".to_string(),
            speed: 12.5,
            angle: 90.0,
            score: 1234.5678,
        };

        let mut measure = MeasureStream::new();
        original.serialize(&mut measure).expect("measure");

        let mut write = WriteStream::new(64);
        original.serialize(&mut write).expect("write");
        assert_eq!(write.bits_processed(), measure.bits_processed());
        let bytes = write.into_bytes();
        assert_eq!(bytes.len(), measure.bytes_required());

        let mut decoded = Sample::default();
        let mut read = ReadStream::new(&bytes);
        decoded.serialize(&mut read).expect("read");
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_integer_width() {
        let mut measure = MeasureStream::new();
        let mut value = 3;
        measure.serialize_integer(&mut value, 0, 7).expect("measure");
        assert_eq!(measure.bits_processed(), 3);
        measure.serialize_integer(&mut value, 3, 3).expect("zero width");
        assert_eq!(measure.bits_processed(), 3);
    }

    #[test]
    fn test_out_of_range_write_rejected() {
        let mut stream = WriteStream::new(8);
        let mut value = 11;
        assert!(matches!(
            stream.serialize_integer(&mut value, 0, 10),
            Err(NetError::ValueOutOfRange { value: 11, .. })
        ));
    }

    #[test]
    fn test_string_length_limit() {
        let mut stream = WriteStream::new(512);
        let mut long = "x".repeat(256);
        assert!(matches!(
            stream.serialize_string(&mut long),
            Err(NetError::StringTooLong(256))
        ));
        let mut max = "y".repeat(255);
        stream.serialize_string(&mut max).expect("255 bytes fit");
    }

    #[test]
    fn test_compressed_float_precision() {
        let mut write = WriteStream::new(8);
        let mut value = 123.3f32;
        write
            .serialize_compressed_float(&mut value, 0.0, 360.0, 0.1)
            .expect("write");
        let bytes = write.into_bytes();

        let mut read = ReadStream::new(&bytes);
        let mut decoded = 0.0f32;
        read.serialize_compressed_float(&mut decoded, 0.0, 360.0, 0.1)
            .expect("read");
        assert!((decoded - 123.3).abs() <= 0.1);
    }

    #[test]
    fn test_checkpoint_catches_desync() {
        let mut write = WriteStream::new(16);
        let mut a = 5;
        let mut flag = true;
        write.serialize_integer(&mut a, 0, 15).expect("a");
        write.serialize_bool(&mut flag).expect("flag");
        write.checkpoint().expect("checkpoint");
        let bytes = write.into_bytes();

        // Reader skips the bool: the checkpoint lands one bit early.
        let mut read = ReadStream::new(&bytes);
        let mut b = 0;
        read.serialize_integer(&mut b, 0, 15).expect("a");
        assert!(matches!(
            read.checkpoint(),
            Err(NetError::CheckpointMismatch { bit: 4, .. })
        ));
    }

    #[test]
    fn test_journal_records_positions() {
        let mut write = WriteStream::new(16);
        write.enable_journal();
        let mut value = 1;
        write.serialize_integer(&mut value, 0, 3).expect("integer");
        write.checkpoint().expect("checkpoint");
        let journal = write.journal();
        assert_eq!(journal.len(), 2);
        assert_eq!(journal[0], JournalEntry { label: "integer", bit_offset: 0, bits: 2 });
        assert_eq!(journal[1].label, "checkpoint");
        assert_eq!(journal[1].bit_offset, 2);
    }

    #[test]
    fn test_pad_to_nearest_byte_in_all_modes() {
        let mut measure = MeasureStream::new();
        let mut flag = true;
        measure.serialize_bool(&mut flag).expect("bit");
        measure.pad_to_nearest_byte().expect("pad");
        assert_eq!(measure.bits_processed(), 8);

        let mut write = WriteStream::new(2);
        write.serialize_bool(&mut flag).expect("bit");
        write.pad_to_nearest_byte().expect("pad");
        let mut byte = 0xAB;
        write.serialize_byte(&mut byte).expect("byte");
        assert_eq!(write.as_bytes(), &[0x80, 0xAB]);
    }
}
