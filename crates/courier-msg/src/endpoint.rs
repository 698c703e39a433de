//! ---
//! courier_section: "02-envelope-model"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Endpoint addressing and envelope data model."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::fmt;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use crate::{EnvelopeError, Result};

/// Ordered, duplicate-free recipient set carried by an envelope.
pub type Recipients = IndexSet<Endpoint>;

/// Logical destination of an envelope.
///
/// Unset fields act as wildcards when matching against a concrete process
/// identity. Empty strings are normalised to `None`, and at least one field
/// must remain set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "EndpointParts", into = "EndpointParts")]
pub struct Endpoint {
    app_id: Option<String>,
    app_instance_id: Option<String>,
    channel: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EndpointParts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    app_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    app_instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    channel: Option<String>,
}

impl TryFrom<EndpointParts> for Endpoint {
    type Error = EnvelopeError;

    fn try_from(parts: EndpointParts) -> Result<Self> {
        Endpoint::new(parts.app_id, parts.app_instance_id, parts.channel)
    }
}

impl From<Endpoint> for EndpointParts {
    fn from(endpoint: Endpoint) -> Self {
        Self {
            app_id: endpoint.app_id,
            app_instance_id: endpoint.app_instance_id,
            channel: endpoint.channel,
        }
    }
}

fn normalise(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

impl Endpoint {
    /// Build an endpoint from optional parts, rejecting fully wildcard addresses.
    pub fn new(
        app_id: Option<String>,
        app_instance_id: Option<String>,
        channel: Option<String>,
    ) -> Result<Self> {
        let endpoint = Self {
            app_id: normalise(app_id),
            app_instance_id: normalise(app_instance_id),
            channel: normalise(channel),
        };
        if endpoint.app_id.is_none()
            && endpoint.app_instance_id.is_none()
            && endpoint.channel.is_none()
        {
            return Err(EnvelopeError::InvalidEndpoint);
        }
        Ok(endpoint)
    }

    /// Address a specific running instance of an application.
    pub fn instance(app_id: impl Into<String>, app_instance_id: impl Into<String>) -> Self {
        Self {
            app_id: normalise(Some(app_id.into())),
            app_instance_id: normalise(Some(app_instance_id.into())),
            channel: None,
        }
    }

    /// Address any instance of an application.
    pub fn app(app_id: impl Into<String>) -> Self {
        Self {
            app_id: normalise(Some(app_id.into())),
            app_instance_id: None,
            channel: None,
        }
    }

    /// Address an instance by id regardless of the application it belongs to.
    pub fn instance_id(app_instance_id: impl Into<String>) -> Self {
        Self {
            app_id: None,
            app_instance_id: normalise(Some(app_instance_id.into())),
            channel: None,
        }
    }

    /// Address a named channel.
    pub fn channel(name: impl Into<String>) -> Self {
        Self {
            app_id: None,
            app_instance_id: None,
            channel: normalise(Some(name.into())),
        }
    }

    /// Return a copy of this endpoint narrowed to the given channel.
    pub fn with_channel(mut self, name: impl Into<String>) -> Self {
        self.channel = normalise(Some(name.into()));
        self
    }

    /// Application id, if set.
    pub fn app_id(&self) -> Option<&str> {
        self.app_id.as_deref()
    }

    /// Application instance id, if set.
    pub fn app_instance_id(&self) -> Option<&str> {
        self.app_instance_id.as_deref()
    }

    /// Channel name, if set.
    pub fn channel_name(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    /// True when at least one field is set. Deserialised and constructed
    /// endpoints always satisfy this.
    pub fn is_addressable(&self) -> bool {
        self.app_id.is_some() || self.app_instance_id.is_some() || self.channel.is_some()
    }

    /// True when every field set on `self` equals the same field on `target`.
    pub fn matches(&self, target: &Endpoint) -> bool {
        field_matches(&self.app_id, &target.app_id)
            && field_matches(&self.app_instance_id, &target.app_instance_id)
            && field_matches(&self.channel, &target.channel)
    }
}

fn field_matches(pattern: &Option<String>, target: &Option<String>) -> bool {
    match pattern {
        None => true,
        Some(expected) => target.as_deref() == Some(expected.as_str()),
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}",
            self.app_id.as_deref().unwrap_or("*"),
            self.app_instance_id.as_deref().unwrap_or("*")
        )?;
        if let Some(channel) = &self.channel {
            write!(f, "#{channel}")?;
        }
        Ok(())
    }
}
