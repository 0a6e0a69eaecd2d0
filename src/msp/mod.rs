//! MultiWii Serial Protocol v1
//!
//! - [`code`]: message ids
//! - [`codec`]: byte-at-a-time frame decoder and encoder
//! - [`dispatch`]: applies decoded frames to a [`VehicleState`](crate::state::VehicleState)
//! - [`commands`]: outbound payload builders

pub mod code;
pub mod codec;
pub mod commands;
pub mod dispatch;
pub mod payload;

pub use code::MspCode;
pub use codec::{encode_request, DecodeError, Direction, Frame, MspCodec, Role};
pub use commands::Command;
pub use dispatch::{DispatchError, Dispatcher};
