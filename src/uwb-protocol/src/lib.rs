// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Backend wire protocol for the UWB gateway.
//!
//! Events travel as JSON lines of the form `{"event": ..., "data": ...}`.

pub mod codec;
pub mod mapping;
pub mod types;

pub use codec::{encode_event, parse_event, ProtocolError};
pub use mapping::request_to_command;
pub use types::{
    AckResult, AnchorData, BackendEvent, CommandAck, CommandRequest, Hello, OutboundEvent, TagData,
};
