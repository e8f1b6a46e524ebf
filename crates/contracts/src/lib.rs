//! Message contracts for the TARS bus.
//!
//! Every payload on the bus is a JSON [`Envelope`] whose `data` field is
//! one of the typed records in [`events`]. Topic constants and the MQTT
//! wildcard matcher live in [`topics`].

pub mod envelope;
pub mod error;
pub mod events;
pub mod topics;

pub use envelope::Envelope;
pub use error::CodecError;
pub use events::EventPayload;
pub use topics::topic_matches;
