//! Long-lived task threads
//!
//! Two threads cooperate through [`crate::state::NodeState`]: the network
//! task owns the control socket and applies inbound commands, the
//! acquisition task samples the ADC and emits batched data packets. Both are
//! spawned from `main` and wind down when the shared running flag clears.

pub mod acquisition;
pub mod network;

pub use acquisition::Acquisition;
pub use network::{NetHandle, NetworkTask};
