//! StripAlerts provisioning protocol - channels, chunk framing and reassembly
//!
//! This crate has no transport: it describes what travels over the six
//! provisioning channels and how multi-frame values are split and rebuilt.

pub mod ble;
pub mod chunk;
pub mod reassembly;

pub use ble::Channel;
pub use chunk::{FieldBuffer, FrameError, FrameTag, OutboundFrame};
pub use reassembly::{FrameReassembler, InboundFrame, Network, NetworksDecoder, ReassemblyMode};
