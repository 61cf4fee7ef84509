//! Client protocol: framing, request decoding and the per-connection
//! session state machine.

pub mod codec;
pub mod handler;

pub use codec::{Connection, Request};
pub use handler::Session;
