//! ---
//! courier_section: "01-core-functionality"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Shared configuration and logging for Courier processes."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
//! Shared primitives for Courier processes: TOML configuration loading and
//! tracing setup.

pub mod config;
pub mod logging;

pub use config::{
    BrokerConfig, CourierConfig, IdentityConfig, LoadedConfig, LoggingConfig, MetricsConfig,
    PubSubConfig, RouterToggle, RoutersConfig,
};
pub use logging::{env_filter, init_tracing, LogFormat, LOG_ENV};

/// Crate version stamped into build metrics and CLI output.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
