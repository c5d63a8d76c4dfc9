//! # Protocol Layer
//!
//! Message framing and link-level reliability, independent of any socket.
//!
//! ## Components
//! - **Message**: typed payloads and the factory rebuilding them from a tag
//! - **Fragment**: splitting and reassembling payloads larger than one packet
//! - **Reliability**: sequence numbers, ack bitfields, RTT and bandwidth
//! - **Flow Control**: RTT-driven send rate with a penalty back-off

pub mod flow_control;
pub mod fragment;
pub mod message;
pub mod reliability;

pub use flow_control::{FlowControl, FlowMode};
pub use fragment::{FragmentBuffer, FragmentSource};
pub use message::{Message, MessageFactory};
pub use reliability::ReliabilitySystem;
