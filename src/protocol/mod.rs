//! Relay <-> client wire protocol

pub mod messages;

pub use messages::{ClientMessage, MessageError, ServerMessage, StatusState};
