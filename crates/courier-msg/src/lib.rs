//! ---
//! courier_section: "02-envelope-model"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Endpoint addressing and envelope data model."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
#![warn(missing_docs)]

pub mod endpoint;
pub mod envelope;
pub mod logging;

/// Shared result type for envelope construction.
pub type Result<T> = std::result::Result<T, EnvelopeError>;

/// Validation failures raised while building endpoints or envelopes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    /// The envelope content was null.
    #[error("envelope content must not be empty")]
    EmptyContent,
    /// An endpoint carried no addressable field.
    #[error("endpoint must set at least one of app id, instance id or channel")]
    InvalidEndpoint,
    /// The envelope tried to reply to itself.
    #[error("envelope {0} cannot reply to itself")]
    SelfReply(MessageId),
    /// A payload could not be converted to or from its typed form.
    #[error("payload codec failure: {0}")]
    Codec(String),
}

pub use endpoint::{Endpoint, Recipients};
pub use envelope::{Content, Envelope, EnvelopeOptions, MessageId, RemoteFault, SCHEMA_VERSION};
pub use logging::{log_envelope, MessageDirection};
