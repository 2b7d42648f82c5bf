//! In-memory runtime for tests

use super::{ContainerRuntime, Instance, LaunchSpec};
use crate::error::{MusterError, Result};
use crate::manifest::Command;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Something the fake runtime was asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeEvent {
    Started(String),
    Stopped(String),
    Synced(String, String),
}

#[derive(Default)]
pub struct FakeRuntime {
    events: Mutex<Vec<FakeEvent>>,
    /// Scripted probe results, then the result once the script runs out
    probes: Mutex<HashMap<String, (VecDeque<bool>, bool)>>,
    failing_probes: Mutex<HashSet<String>>,
    probe_delay: Mutex<HashMap<String, Duration>>,
    probe_times: Mutex<HashMap<String, Vec<Instant>>>,
    fail_start: Mutex<HashSet<String>>,
    exits: Mutex<HashMap<String, watch::Sender<Option<i32>>>>,
    specs: Mutex<HashMap<String, LaunchSpec>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Probes for `service` always fail
    pub fn never_healthy(&self, service: &str) {
        self.failing_probes.lock().unwrap().insert(service.to_string());
    }

    /// Probes for `service` fail `failures` times, then pass
    pub fn healthy_after(&self, service: &str, failures: usize) {
        let script = std::iter::repeat(false).take(failures).collect();
        self.probes
            .lock()
            .unwrap()
            .insert(service.to_string(), (script, true));
    }

    /// Probes for `service` pass `passes` times, then always fail
    pub fn healthy_then_failing(&self, service: &str, passes: usize) {
        let script = std::iter::repeat(true).take(passes).collect();
        self.probes
            .lock()
            .unwrap()
            .insert(service.to_string(), (script, false));
    }

    /// Each probe for `service` takes `delay`
    pub fn slow_probe(&self, service: &str, delay: Duration) {
        self.probe_delay
            .lock()
            .unwrap()
            .insert(service.to_string(), delay);
    }

    /// Starting `service` fails
    pub fn fail_start(&self, service: &str) {
        self.fail_start.lock().unwrap().insert(service.to_string());
    }

    /// Make the current instance of `service` exit
    pub fn exit(&self, service: &str, code: i32) {
        let exits = self.exits.lock().unwrap();
        for (id, tx) in exits.iter() {
            if id.starts_with(&format!("{}-", service)) {
                tx.send_replace(Some(code));
            }
        }
    }

    pub fn events(&self) -> Vec<FakeEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn started(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                FakeEvent::Started(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                FakeEvent::Stopped(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    pub fn probe_times(&self, service: &str) -> Vec<Instant> {
        self.probe_times
            .lock()
            .unwrap()
            .get(service)
            .cloned()
            .unwrap_or_default()
    }

    pub fn launch_spec(&self, service: &str) -> Option<LaunchSpec> {
        self.specs.lock().unwrap().get(service).cloned()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn start(&self, spec: &LaunchSpec) -> Result<Instance> {
        if self.fail_start.lock().unwrap().contains(&spec.service) {
            return Err(MusterError::Start {
                service: spec.service.clone(),
                message: "refused by test runtime".to_string(),
            });
        }
        let mut instance = Instance::new(&spec.service, None, spec.image.clone());
        instance.id = format!("{}-{}", spec.service, instance.id);
        let (tx, _) = watch::channel(None);
        self.exits.lock().unwrap().insert(instance.id.clone(), tx);
        self.specs
            .lock()
            .unwrap()
            .insert(spec.service.clone(), spec.clone());
        self.events
            .lock()
            .unwrap()
            .push(FakeEvent::Started(spec.service.clone()));
        Ok(instance)
    }

    async fn stop(&self, instance: &Instance, _grace: Duration) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(FakeEvent::Stopped(instance.service.clone()));
        if let Some(tx) = self.exits.lock().unwrap().get(&instance.id) {
            tx.send_replace(Some(0));
        }
        Ok(())
    }

    async fn probe(&self, instance: &Instance, _test: &Command) -> Result<bool> {
        self.probe_times
            .lock()
            .unwrap()
            .entry(instance.service.clone())
            .or_default()
            .push(Instant::now());

        let delay = self.probe_delay.lock().unwrap().get(&instance.service).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.failing_probes.lock().unwrap().contains(&instance.service) {
            return Ok(false);
        }
        let scripted = self
            .probes
            .lock()
            .unwrap()
            .get_mut(&instance.service)
            .map(|(script, then)| script.pop_front().unwrap_or(*then));
        Ok(scripted.unwrap_or(true))
    }

    async fn wait(&self, instance: &Instance) -> Result<i32> {
        let rx = self
            .exits
            .lock()
            .unwrap()
            .get(&instance.id)
            .map(|tx| tx.subscribe());
        let Some(mut rx) = rx else {
            return Ok(0);
        };
        loop {
            if let Some(code) = *rx.borrow() {
                return Ok(code);
            }
            if rx.changed().await.is_err() {
                return Ok(0);
            }
        }
    }

    async fn sync(&self, instance: &Instance, source: &Path, target: &str) -> Result<()> {
        self.events.lock().unwrap().push(FakeEvent::Synced(
            instance.service.clone(),
            format!("{} -> {}", source.display(), target),
        ));
        Ok(())
    }
}
