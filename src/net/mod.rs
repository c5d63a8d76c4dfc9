//! # Messaging
//!
//! Typed messages over any [`Transport`](crate::transport::Transport).
//!
//! ## Components
//! - **Queue**: per-node reliable and unreliable outgoing messages
//! - **DrudgeNet**: packing, fragmentation, acknowledgement and delivery

pub mod drudge;
pub mod queue;

pub use drudge::{DrudgeNet, NetEvent};
pub use queue::{MessageId, MessageQueue};
