//! Envelope and message schema for the star message bus.
//!
//! This crate owns the wire format only: construction, (de)serialization,
//! and the validation rules that make a decoded envelope well-formed. It
//! has no knowledge of transports, routing, or client state machines.

mod envelope;
mod error;
mod message;
mod types;

pub use envelope::{Envelope, BROADCAST};
pub use error::ProtocolError;
pub use message::{
    ActionMessage, ErrorMessage, EventMessage, Message, OutcomeMessage, RegistrationMessage,
    Status, StreamMessage,
};
pub use types::{ClientInfo, ClientType, EnvelopeType};
