//! ---
//! courier_section: "04-broker-correlation"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Message broker, router selection and correlation."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
//! Message broker for the Courier workspace.
//!
//! [`MessageBroker`] is the application-facing entry point: it wraps content
//! into envelopes, picks routers through the [`RouterSelector`], and awaits
//! replies through the [`CorrelationEngine`]. Inbound requests are answered
//! by the configured [`MessageProcessor`].
#![warn(missing_docs)]

pub mod broker;
pub mod correlation;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod processor;
pub mod selector;

pub use broker::{BrokerSettings, DispatchOptions, MessageBroker, MessageBrokerBuilder, EMPTY_REPLY};
pub use correlation::{Awaiter, Completion, CorrelationEngine, Reply};
pub use error::{BrokerError, CorrelationError, Result};
pub use identity::{IdentityProvider, StaticIdentity};
pub use metrics::BrokerMetrics;
pub use processor::{FnProcessor, MessageProcessor, RejectingProcessor, NO_PROCESSOR};
pub use selector::{Route, RouterSelector, SelectionError};

pub use tokio_util::sync::CancellationToken;
