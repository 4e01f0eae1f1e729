//! Wire-protocol building blocks
//!
//! The pieces every higher layer is made of:
//! - Cell and relay-header codec
//! - The two hop handshakes and their key schedule
//! - Per-hop relay-cell cryptography
//! - SENDME credit windows

pub mod cell;
pub mod crypto;
pub mod flow_control;
pub mod handshake;

pub use cell::{Cell, CellCommand, DestroyReason, EndReason, RelayCell, RelayCommand, VarCell};
pub use crypto::{CellDirection, HopCrypt};
pub use flow_control::{CircuitWindows, StreamWindows, Window};
pub use handshake::{HandshakeProvider, HopKeyMaterial, KeyGeneration, PendingHandshake};
