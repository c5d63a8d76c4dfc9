//! # Checksum
//!
//! CRC32C gate against cross-talk between unrelated sessions.
//!
//! Every framed datagram reserves its first four bytes for a checksum. The CRC32C
//! is computed over the whole datagram with those four bytes replaced by the
//! big-endian protocol ID, then stored big-endian in their place. A receiver
//! performs the same substitution and compares. A datagram from a session with a
//! different protocol ID, or one corrupted in transit, fails the comparison and
//! is dropped. This is not authentication.

/// Bytes reserved at the front of every framed datagram
pub const CHECKSUM_SIZE: usize = 4;

/// CRC32C of `data` with its first four bytes read as the protocol ID
///
/// Returns `None` when `data` is shorter than the checksum field.
pub fn compute(data: &[u8], protocol_id: u32) -> Option<u32> {
    if data.len() < CHECKSUM_SIZE {
        return None;
    }
    let crc = crc32c::crc32c(&protocol_id.to_be_bytes());
    Some(crc32c::crc32c_append(crc, &data[CHECKSUM_SIZE..]))
}

/// Overwrite the checksum field of `data` in place
///
/// Buffers shorter than the checksum field are left untouched.
pub fn stamp(data: &mut [u8], protocol_id: u32) {
    if let Some(crc) = compute(data, protocol_id) {
        data[..CHECKSUM_SIZE].copy_from_slice(&crc.to_be_bytes());
    }
}

/// True when the checksum field matches the substituted CRC
pub fn verify(data: &[u8], protocol_id: u32) -> bool {
    match compute(data, protocol_id) {
        Some(crc) => data[..CHECKSUM_SIZE] == crc.to_be_bytes(),
        None => false,
    }
}
