//! Message Channel between the supervisor and its session workers.
//!
//! Every [`Message`] travels as one fixed-size record of [`MESSAGE_SIZE`]
//! bytes over a unidirectional pipe. Records are written whole and only ever
//! surfaced to the reader whole; a short record at end of stream is reported
//! as a closed peer.
pub mod channel;
pub mod errors;
pub mod message;

pub use channel::*;
pub use errors::*;
pub use message::*;
