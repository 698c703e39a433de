//! ---
//! courier_section: "04-broker-correlation"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Priority ordered router selection."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
//! Router selection.
//!
//! Routers are kept sorted by descending priority, ties broken by
//! registration order. Only routers that initialised successfully take part
//! in selection.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use courier_msg::{Endpoint, Recipients};
use courier_router::{InboundEnvelope, InboundSink, Router, RouterContext};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::BrokerError;

/// Selection failed to cover the recipients.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectionError {
    /// These recipients have no active router. Empty for a broadcast.
    #[error("no active router for {} recipient(s)", uncovered.len())]
    Unroutable {
        /// Recipients nobody can reach.
        uncovered: Vec<Endpoint>,
    },
}

impl From<SelectionError> for BrokerError {
    fn from(err: SelectionError) -> Self {
        match err {
            SelectionError::Unroutable { uncovered } => BrokerError::Unroutable {
                recipients: uncovered,
            },
        }
    }
}

/// One router call: the router and the recipients it is responsible for.
#[derive(Clone)]
pub struct Route {
    /// Router to call.
    pub router: Arc<dyn Router>,
    /// Subset of recipients assigned to it; empty for a broadcast.
    pub recipients: Recipients,
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("router", &self.router.name())
            .field("recipients", &self.recipients)
            .finish()
    }
}

struct Registered {
    router: Arc<dyn Router>,
    priority: i32,
    active: AtomicBool,
}

/// Ordered set of routers and the logic picking among them.
#[derive(Default)]
pub struct RouterSelector {
    entries: Vec<Registered>,
}

impl RouterSelector {
    /// Empty selector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a router. Higher priority wins; equal priorities keep registration order.
    pub fn register(&mut self, router: Arc<dyn Router>, priority: i32) {
        let position = self
            .entries
            .iter()
            .position(|entry| entry.priority < priority)
            .unwrap_or(self.entries.len());
        self.entries.insert(
            position,
            Registered {
                router,
                priority,
                active: AtomicBool::new(false),
            },
        );
    }

    /// Initialise every router, each with its own tagged inbound sink.
    /// Failing routers stay inactive. Returns the number of active routers.
    pub async fn initialize_all(
        &self,
        local: &Endpoint,
        inbound: &mpsc::Sender<InboundEnvelope>,
    ) -> usize {
        let mut active = 0;
        for entry in &self.entries {
            let name = entry.router.name().to_owned();
            let context = RouterContext {
                local: local.clone(),
                inbound: InboundSink::new(name.clone(), inbound.clone()),
            };
            match entry.router.initialize(context).await {
                Ok(()) => {
                    entry.active.store(true, Ordering::Release);
                    active += 1;
                    info!(router = %name, priority = entry.priority, "router active");
                }
                Err(err) => {
                    entry.active.store(false, Ordering::Release);
                    warn!(router = %name, error = %err, "router failed to initialise, excluded from selection");
                }
            }
        }
        active
    }

    fn active(&self) -> impl Iterator<Item = &Registered> {
        self.entries
            .iter()
            .filter(|entry| entry.active.load(Ordering::Acquire))
    }

    /// Names of the active routers in selection order.
    pub fn active_names(&self) -> Vec<String> {
        self.active()
            .map(|entry| entry.router.name().to_owned())
            .collect()
    }

    /// Active router registered under `name`.
    pub fn active_router(&self, name: &str) -> Option<Arc<dyn Router>> {
        self.active()
            .find(|entry| entry.router.name() == name)
            .map(|entry| entry.router.clone())
    }

    /// Plan the router calls needed to reach `recipients`.
    pub fn select(&self, recipients: &Recipients) -> Result<Vec<Route>, SelectionError> {
        if recipients.is_empty() {
            let routes: Vec<Route> = self
                .active()
                .filter(|entry| entry.router.can_handle(recipients))
                .map(|entry| Route {
                    router: entry.router.clone(),
                    recipients: Recipients::new(),
                })
                .collect();
            if routes.is_empty() {
                return Err(SelectionError::Unroutable {
                    uncovered: Vec::new(),
                });
            }
            return Ok(routes);
        }

        let mut planned: Vec<(usize, Route)> = Vec::new();
        let mut uncovered = Vec::new();
        for recipient in recipients {
            let single: Recipients = std::iter::once(recipient.clone()).collect();
            let chosen = self
                .entries
                .iter()
                .enumerate()
                .filter(|(_, entry)| entry.active.load(Ordering::Acquire))
                .find(|(_, entry)| entry.router.can_handle(&single));
            match chosen {
                Some((index, entry)) => {
                    match planned.iter_mut().find(|(planned_index, _)| *planned_index == index) {
                        Some((_, route)) => {
                            route.recipients.insert(recipient.clone());
                        }
                        None => planned.push((
                            index,
                            Route {
                                router: entry.router.clone(),
                                recipients: single,
                            },
                        )),
                    }
                }
                None => uncovered.push(recipient.clone()),
            }
        }

        if !uncovered.is_empty() {
            return Err(SelectionError::Unroutable { uncovered });
        }
        planned.sort_by_key(|(index, _)| *index);
        Ok(planned.into_iter().map(|(_, route)| route).collect())
    }

    /// Shut every router down, active or not.
    pub async fn shutdown_all(&self) {
        for entry in &self.entries {
            entry.active.store(false, Ordering::Release);
            if let Err(err) = entry.router.shutdown().await {
                warn!(router = %entry.router.name(), error = %err, "router shutdown failed");
            }
        }
    }
}
