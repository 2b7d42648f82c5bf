//! Service status board
//!
//! The board is the only place per-service status changes. Every change goes
//! through [`StatusBoard::transition`], which checks the move against the
//! lifecycle, publishes the new snapshot to waiters and broadcasts a
//! [`StatusEvent`].

use crate::error::{MusterError, Result};
use crate::manifest::DependencyCondition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::{broadcast, watch};

/// Capacity of the event broadcast channel
const EVENT_CAPACITY: usize = 256;

/// Lifecycle state of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// Waiting for dependencies
    Pending,
    /// Resources bound, process launching
    Starting,
    /// Process running
    Started,
    /// Health probe passed
    Healthy,
    /// Health probe retries exhausted
    Unhealthy,
    /// Could not bind, start or build, or exited non-zero
    Failed,
    /// A required dependency never reached its condition
    Blocked,
    /// Stop requested
    Stopping,
    /// Stopped, exited cleanly, or never started
    Stopped,
}

impl ServiceStatus {
    /// Terminal states end a lifecycle
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ServiceStatus::Stopped | ServiceStatus::Failed | ServiceStatus::Blocked
        )
    }

    /// Whether the service has a live instance
    pub fn is_running(self) -> bool {
        matches!(
            self,
            ServiceStatus::Started | ServiceStatus::Healthy | ServiceStatus::Unhealthy
        )
    }

    /// Whether moving to `to` is a legal lifecycle step
    pub fn can_transition_to(self, to: ServiceStatus) -> bool {
        use ServiceStatus::*;
        match (self, to) {
            (Pending, Starting | Blocked | Failed | Stopped) => true,
            (Starting, Started | Failed | Stopping) => true,
            (Started, Healthy | Unhealthy | Failed | Stopping | Stopped) => true,
            (Healthy, Unhealthy | Failed | Stopping | Stopped) => true,
            (Unhealthy, Failed | Stopping | Stopped) => true,
            (Stopping, Stopped | Failed) => true,
            // A restart begins a new lifecycle
            (Stopped | Failed | Blocked, Pending) => true,
            _ => false,
        }
    }

    /// How this status relates to a dependency condition
    pub fn check(self, condition: DependencyCondition) -> Readiness {
        use ServiceStatus::*;
        match condition {
            DependencyCondition::Started => match self {
                Started | Healthy | Unhealthy | Stopping | Stopped => Readiness::Ready,
                Failed | Blocked => Readiness::Never,
                Pending | Starting => Readiness::Waiting,
            },
            DependencyCondition::Healthy => match self {
                Healthy => Readiness::Ready,
                Unhealthy | Failed | Blocked | Stopping | Stopped => Readiness::Never,
                Pending | Starting | Started => Readiness::Waiting,
            },
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceStatus::Pending => "pending",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Started => "started",
            ServiceStatus::Healthy => "healthy",
            ServiceStatus::Unhealthy => "unhealthy",
            ServiceStatus::Failed => "failed",
            ServiceStatus::Blocked => "blocked",
            ServiceStatus::Stopping => "stopping",
            ServiceStatus::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of checking a dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Condition met
    Ready,
    /// Not yet met
    Waiting,
    /// Can no longer be met in this lifecycle
    Never,
}

/// A status change
#[derive(Debug, Clone, Serialize)]
pub struct StatusEvent {
    /// Service
    pub service: String,
    /// Previous status
    pub from: ServiceStatus,
    /// New status
    pub to: ServiceStatus,
    /// Why, when there is more to say than the status
    pub reason: Option<String>,
    /// When the change happened
    pub at: DateTime<Utc>,
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.service, self.from, self.to)?;
        if let Some(reason) = &self.reason {
            write!(f, " ({})", reason)?;
        }
        Ok(())
    }
}

/// Shared status of every service in a run
pub struct StatusBoard {
    state: watch::Sender<BTreeMap<String, ServiceStatus>>,
    events: broadcast::Sender<StatusEvent>,
}

impl StatusBoard {
    /// Board with every service `pending`
    pub fn new<I, S>(services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let initial = services
            .into_iter()
            .map(|s| (s.into(), ServiceStatus::Pending))
            .collect();
        let (state, _) = watch::channel(initial);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { state, events }
    }

    /// Current status of a service
    pub fn get(&self, service: &str) -> Option<ServiceStatus> {
        self.state.borrow().get(service).copied()
    }

    /// Copy of every status
    pub fn snapshot(&self) -> BTreeMap<String, ServiceStatus> {
        self.state.borrow().clone()
    }

    /// Subscribe to status events
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// Receiver of whole-board snapshots
    pub fn watch(&self) -> watch::Receiver<BTreeMap<String, ServiceStatus>> {
        self.state.subscribe()
    }

    /// Move `service` to `to`, returning the previous status
    pub fn transition(
        &self,
        service: &str,
        to: ServiceStatus,
        reason: Option<String>,
    ) -> Result<ServiceStatus> {
        let mut outcome = Err(MusterError::ServiceNotFound(service.to_string()));

        self.state.send_if_modified(|map| match map.get_mut(service) {
            None => false,
            Some(current) if current.can_transition_to(to) => {
                outcome = Ok(*current);
                *current = to;
                true
            }
            Some(current) => {
                outcome = Err(MusterError::InvalidTransition {
                    service: service.to_string(),
                    from: current.to_string(),
                    to: to.to_string(),
                });
                false
            }
        });

        let from = outcome?;
        let event = StatusEvent {
            service: service.to_string(),
            from,
            to,
            reason,
            at: Utc::now(),
        };
        tracing::debug!("{}", event);
        let _ = self.events.send(event);
        Ok(from)
    }

    /// Wait until `service` meets `condition` or can no longer meet it.
    /// Returns the status that decided it.
    pub async fn wait_for(
        &self,
        service: &str,
        condition: DependencyCondition,
    ) -> (Readiness, Option<ServiceStatus>) {
        let mut rx = self.state.subscribe();
        loop {
            let status = rx.borrow_and_update().get(service).copied();
            match status {
                None => return (Readiness::Never, None),
                Some(status) => match status.check(condition) {
                    Readiness::Waiting => {}
                    decided => return (decided, Some(status)),
                },
            }
            if rx.changed().await.is_err() {
                return (Readiness::Never, status);
            }
        }
    }

    /// Wait until `service` satisfies `done`
    pub async fn wait_until<F>(&self, service: &str, done: F) -> Option<ServiceStatus>
    where
        F: Fn(ServiceStatus) -> bool,
    {
        let mut rx = self.state.subscribe();
        loop {
            let status = rx.borrow_and_update().get(service).copied()?;
            if done(status) {
                return Some(status);
            }
            if rx.changed().await.is_err() {
                return Some(status);
            }
        }
    }
}
