//! # Bit Packer
//!
//! Bit-granularity writer and reader over byte buffers.
//!
//! Bits are packed most-significant first, so a 32-bit value written on a byte
//! boundary appears big-endian on the wire. The writer has a fixed capacity in
//! bytes; neither side ever reads or writes outside its buffer.

use crate::error::{NetError, Result};

/// Number of bits needed to represent every value in the closed range `[min, max]`
///
/// `ceil(log2(max - min + 1))`, which is zero when `min == max`.
pub fn bits_required(min: i64, max: i64) -> u32 {
    debug_assert!(max >= min);
    let range = max.wrapping_sub(min) as u64;
    if range == 0 {
        0
    } else {
        64 - range.leading_zeros()
    }
}

/// Writes bits into a bounded, zero-initialised byte buffer
#[derive(Debug, Clone)]
pub struct BitWriter {
    buffer: Vec<u8>,
    bit_index: usize,
}

impl BitWriter {
    /// Create a writer holding at most `capacity` bytes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: vec![0u8; capacity],
            bit_index: 0,
        }
    }

    /// Write the low `bits` bits of `value` (`bits` in `0..=32`)
    pub fn write_bits(&mut self, value: u32, bits: u32) -> Result<()> {
        debug_assert!(bits <= 32);
        if bits == 0 {
            return Ok(());
        }
        let needed = bits as usize;
        if needed > self.bits_available() {
            return Err(NetError::StreamOverflow {
                needed,
                available: self.bits_available(),
            });
        }

        let value = if bits < 32 { value & ((1u32 << bits) - 1) } else { value };
        let mut remaining = bits;
        while remaining > 0 {
            let byte = self.bit_index / 8;
            let free = 8 - (self.bit_index % 8) as u32;
            let take = free.min(remaining);
            let chunk = (value >> (remaining - take)) & ((1u32 << take) - 1);
            self.buffer[byte] |= (chunk << (free - take)) as u8;
            self.bit_index += take as usize;
            remaining -= take;
        }
        Ok(())
    }

    /// Write whole bytes, which is fast when the writer is byte aligned
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        if self.bit_index % 8 == 0 {
            let needed = data.len() * 8;
            if needed > self.bits_available() {
                return Err(NetError::StreamOverflow {
                    needed,
                    available: self.bits_available(),
                });
            }
            let start = self.bit_index / 8;
            self.buffer[start..start + data.len()].copy_from_slice(data);
            self.bit_index += needed;
            return Ok(());
        }
        for &byte in data {
            self.write_bits(u32::from(byte), 8)?;
        }
        Ok(())
    }

    /// Write zero bits up to the next byte boundary
    pub fn align(&mut self) -> Result<()> {
        let pad = (8 - self.bit_index % 8) % 8;
        self.write_bits(0, pad as u32)
    }

    pub fn bits_written(&self) -> usize {
        self.bit_index
    }

    /// Bytes touched so far, counting a partial final byte
    pub fn bytes_written(&self) -> usize {
        self.bit_index.div_ceil(8)
    }

    pub fn bits_available(&self) -> usize {
        self.buffer.len() * 8 - self.bit_index
    }

    pub fn capacity_bits(&self) -> usize {
        self.buffer.len() * 8
    }

    /// The written bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer[..self.bytes_written()]
    }

    /// Consume the writer, returning exactly the written bytes
    pub fn into_bytes(mut self) -> Vec<u8> {
        let len = self.bytes_written();
        self.buffer.truncate(len);
        self.buffer
    }
}

/// Reads bits from a borrowed byte slice
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    data: &'a [u8],
    bit_index: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, bit_index: 0 }
    }

    /// Read `bits` bits (`0..=32`) as an unsigned value
    pub fn read_bits(&mut self, bits: u32) -> Result<u32> {
        debug_assert!(bits <= 32);
        if bits == 0 {
            return Ok(0);
        }
        let needed = bits as usize;
        if needed > self.bits_remaining() {
            return Err(NetError::StreamUnderflow {
                needed,
                available: self.bits_remaining(),
            });
        }

        let mut value: u32 = 0;
        let mut remaining = bits;
        while remaining > 0 {
            let byte = self.data[self.bit_index / 8];
            let offset = (self.bit_index % 8) as u32;
            let available = 8 - offset;
            let take = available.min(remaining);
            let chunk = (u32::from(byte) >> (available - take)) & ((1u32 << take) - 1);
            value = (value << take) | chunk;
            self.bit_index += take as usize;
            remaining -= take;
        }
        Ok(value)
    }

    /// Fill `out` with the next bytes
    pub fn read_bytes(&mut self, out: &mut [u8]) -> Result<()> {
        if self.bit_index % 8 == 0 {
            let needed = out.len() * 8;
            if needed > self.bits_remaining() {
                return Err(NetError::StreamUnderflow {
                    needed,
                    available: self.bits_remaining(),
                });
            }
            let start = self.bit_index / 8;
            out.copy_from_slice(&self.data[start..start + out.len()]);
            self.bit_index += needed;
            return Ok(());
        }
        for slot in out.iter_mut() {
            *slot = self.read_bits(8)? as u8;
        }
        Ok(())
    }

    /// Skip to the next byte boundary
    pub fn align(&mut self) -> Result<()> {
        let pad = (8 - self.bit_index % 8) % 8;
        self.read_bits(pad as u32).map(|_| ())
    }

    pub fn bits_read(&self) -> usize {
        self.bit_index
    }

    pub fn bits_remaining(&self) -> usize {
        self.data.len() * 8 - self.bit_index
    }

    /// The unread remainder, starting at the current byte (caller aligns first)
    pub fn remaining_bytes(&self) -> &'a [u8] {
        &self.data[self.bit_index.div_ceil(8).min(self.data.len())..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_required() {
        assert_eq!(bits_required(0, 0), 0);
        assert_eq!(bits_required(0, 1), 1);
        assert_eq!(bits_required(0, 255), 8);
        assert_eq!(bits_required(0, 256), 9);
        assert_eq!(bits_required(-10, 10), 5);
        assert_eq!(bits_required(i32::MIN as i64, i32::MAX as i64), 32);
    }

    #[test]
    fn test_msb_first_layout() {
        let mut writer = BitWriter::with_capacity(4);
        writer.write_bits(0xDEAD_BEEF, 32).expect("fits");
        assert_eq!(writer.as_bytes(), &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn test_unaligned_roundtrip() {
        let mut writer = BitWriter::with_capacity(16);
        writer.write_bits(1, 1).expect("bit");
        writer.write_bits(0x1234_5678, 32).expect("word");
        writer.write_bits(5, 3).expect("small");
        writer.write_bytes(b"ab").expect("bytes");
        assert_eq!(writer.bits_written(), 1 + 32 + 3 + 16);

        let bytes = writer.into_bytes();
        let mut reader = BitReader::new(&bytes);
        assert_eq!(reader.read_bits(1).expect("bit"), 1);
        assert_eq!(reader.read_bits(32).expect("word"), 0x1234_5678);
        assert_eq!(reader.read_bits(3).expect("small"), 5);
        let mut out = [0u8; 2];
        reader.read_bytes(&mut out).expect("bytes");
        assert_eq!(&out, b"ab");
    }

    #[test]
    fn test_overflow_and_underflow() {
        let mut writer = BitWriter::with_capacity(1);
        writer.write_bits(0, 6).expect("fits");
        assert!(matches!(
            writer.write_bits(0, 3),
            Err(NetError::StreamOverflow { needed: 3, available: 2 })
        ));

        let data = [0xFFu8];
        let mut reader = BitReader::new(&data);
        assert!(reader.read_bits(9).is_err());
        assert_eq!(reader.read_bits(8).expect("byte"), 0xFF);
    }

    #[test]
    fn test_align() {
        let mut writer = BitWriter::with_capacity(4);
        writer.write_bits(1, 3).expect("bits");
        writer.align().expect("align");
        assert_eq!(writer.bits_written(), 8);
        writer.align().expect("already aligned");
        assert_eq!(writer.bits_written(), 8);

        let bytes = writer.into_bytes();
        let mut reader = BitReader::new(&bytes);
        reader.read_bits(3).expect("bits");
        reader.align().expect("align");
        assert_eq!(reader.bits_read(), 8);
    }
}
