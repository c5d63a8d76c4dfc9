//! # Core Components
//!
//! Endpoint identity, datagram I/O and bit-level serialization.
//!
//! This module provides the foundation every other layer builds on: IPv4
//! addresses, non-blocking UDP sockets, an MSB-first bit packer and the three
//! serialization streams sharing one contract.
//!
//! ## Components
//! - **Address**: IPv4 + port value type, totally ordered
//! - **Socket**: non-blocking UDP, `Ok(None)` when nothing is pending
//! - **BitPacker**: bounded bit writer and bit reader
//! - **Stream**: write, read and measure streams behind one trait
//!
//! ## Safety
//! - Writers never grow past their capacity
//! - Readers never read past the end of their input
//! - Every failure is an explicit `NetError`

pub mod address;
pub mod bitpacker;
pub mod socket;
pub mod stream;
