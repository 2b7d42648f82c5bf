//! Health gate
//!
//! Probes run on a start-to-start cadence of `interval`; each probe is cut off
//! after `timeout`. `retries` consecutive failures outside `start_period`
//! mark the service unhealthy, which ends polling. Any success before that
//! resets the count and marks the service healthy.

use super::status::{ServiceStatus, StatusBoard};
use crate::error::MusterError;
use crate::manifest::HealthProbe;
use crate::runtime::{ContainerRuntime, Instance};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{sleep_until, timeout, Instant};

/// How a health gate finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthOutcome {
    /// Retries exhausted
    Unhealthy,
    /// The service left the running states
    Ended,
    /// Shutdown was requested
    Cancelled,
}

/// Called with the failure of a service whose retries ran out, before it is
/// marked unhealthy
pub type ExhaustedHook = Arc<dyn Fn(&MusterError) + Send + Sync>;

/// Polls a service's probe and reports transitions on the board
#[derive(Clone)]
pub struct HealthGate {
    runtime: Arc<dyn ContainerRuntime>,
    board: Arc<StatusBoard>,
    on_exhausted: Option<ExhaustedHook>,
}

impl HealthGate {
    /// Create a gate
    pub fn new(runtime: Arc<dyn ContainerRuntime>, board: Arc<StatusBoard>) -> Self {
        Self {
            runtime,
            board,
            on_exhausted: None,
        }
    }

    /// Report exhausted retries to `hook` ahead of the `unhealthy` transition
    pub fn on_exhausted<F>(mut self, hook: F) -> Self
    where
        F: Fn(&MusterError) + Send + Sync + 'static,
    {
        self.on_exhausted = Some(Arc::new(hook));
        self
    }

    /// Poll until the service becomes unhealthy, stops running, or shutdown.
    pub async fn run(
        &self,
        instance: &Instance,
        probe: &HealthProbe,
        mut shutdown: watch::Receiver<bool>,
    ) -> HealthOutcome {
        let service = instance.service.as_str();
        let started = Instant::now();
        let mut next = started;
        let mut failures = 0u32;

        loop {
            if *shutdown.borrow() {
                return HealthOutcome::Cancelled;
            }

            tokio::select! {
                _ = sleep_until(next) => {}
                _ = shutdown.changed() => return HealthOutcome::Cancelled,
            }

            match self.board.get(service) {
                Some(status) if status.is_running() => {}
                _ => return HealthOutcome::Ended,
            }

            let attempt = Instant::now();
            next = attempt + probe.interval;

            let result = tokio::select! {
                r = timeout(probe.timeout, self.runtime.probe(instance, &probe.test)) => r,
                _ = shutdown.changed() => return HealthOutcome::Cancelled,
            };

            let passed = match result {
                Ok(Ok(passed)) => passed,
                Ok(Err(e)) => {
                    tracing::debug!("Probe for {} errored: {}", service, e);
                    false
                }
                Err(_) => {
                    tracing::debug!("Probe for {} timed out after {:?}", service, probe.timeout);
                    false
                }
            };

            if passed {
                failures = 0;
                if self.board.get(service) == Some(ServiceStatus::Started) {
                    if let Err(e) = self.board.transition(service, ServiceStatus::Healthy, None) {
                        tracing::debug!("Ignoring health result for {}: {}", service, e);
                    } else {
                        tracing::info!("Service {} is healthy", service);
                    }
                }
                continue;
            }

            if attempt.duration_since(started) < probe.start_period {
                tracing::debug!("Probe for {} failed during start period", service);
                continue;
            }

            failures += 1;
            tracing::debug!(
                "Probe for {} failed ({}/{})",
                service,
                failures,
                probe.retries
            );

            if failures >= probe.retries {
                match self.board.get(service) {
                    Some(status) if status.is_running() => {}
                    _ => return HealthOutcome::Ended,
                }
                let error = MusterError::HealthExhausted {
                    service: service.to_string(),
                    retries: probe.retries,
                };
                tracing::warn!("{}", error);
                if let Some(hook) = &self.on_exhausted {
                    hook(&error);
                }

                let reason = format!("{} consecutive probe failures", failures);
                return match self
                    .board
                    .transition(service, ServiceStatus::Unhealthy, Some(reason))
                {
                    Ok(_) => {
                        tracing::warn!("Service {} is unhealthy", service);
                        HealthOutcome::Unhealthy
                    }
                    Err(_) => HealthOutcome::Ended,
                };
            }
        }
    }
}
