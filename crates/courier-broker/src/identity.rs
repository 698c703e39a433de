//! ---
//! courier_section: "04-broker-correlation"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Local process identity."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use courier_msg::Endpoint;
use uuid::Uuid;

/// Source of the endpoint stamped as sender on outgoing envelopes.
pub trait IdentityProvider: Send + Sync {
    /// Endpoint identifying this process.
    fn local_endpoint(&self) -> Endpoint;
}

impl IdentityProvider for Endpoint {
    fn local_endpoint(&self) -> Endpoint {
        self.clone()
    }
}

/// Identity fixed at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticIdentity {
    endpoint: Endpoint,
}

impl StaticIdentity {
    /// Use `endpoint` as the local identity.
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    /// Identity for `app_id`; a random instance id is generated when none is given.
    pub fn for_app(app_id: impl Into<String>, instance_id: Option<String>) -> Self {
        let instance = instance_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Self::new(Endpoint::instance(app_id, instance))
    }
}

impl IdentityProvider for StaticIdentity {
    fn local_endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }
}
