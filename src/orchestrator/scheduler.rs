//! Orchestrator
//!
//! One task per service: wait for dependencies on the status board, bind
//! resources, start through the runtime, then hand the instance to an exit
//! monitor and (when a probe is declared) a health gate. Failures are
//! contained to the service they happen in and collected for the report.

use super::graph::{ServiceGraph, StartPlan};
use super::health::HealthGate;
use super::status::{Readiness, ServiceStatus, StatusBoard};
use crate::error::{MusterError, Result};
use crate::image::{BuiltImage, ImageBuilder};
use crate::manifest::{DependencyCondition, HealthProbe, ImageSource, Manifest, Service};
use crate::runtime::{ContainerRuntime, Instance, LaunchSpec};
use crate::storage::Binder;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// A failure contained to one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceFailure {
    /// Service
    pub service: String,
    /// What went wrong
    pub message: String,
    /// Exit code of the failure class
    pub code: u8,
}

impl ServiceFailure {
    fn new(service: &str, error: &MusterError) -> Self {
        Self {
            service: service.to_string(),
            message: error.to_string(),
            code: error.exit_code(),
        }
    }
}

/// Outcome of bringing a topology up
#[derive(Debug, Clone, Serialize)]
pub struct UpReport {
    /// Services in the order they were started
    pub start_order: Vec<String>,
    /// Status of every service when startup settled
    pub statuses: BTreeMap<String, ServiceStatus>,
    /// Per-service failures
    pub failures: Vec<ServiceFailure>,
}

impl UpReport {
    /// Whether every service came up
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Exit code for the run. The most fundamental failure class wins:
    /// build before health before start.
    pub fn exit_code(&self) -> u8 {
        self.failures.iter().map(|f| f.code).min().unwrap_or(0)
    }
}

/// Result of waiting on a service's dependencies
enum Gate {
    Ready,
    Blocked(String),
    Cancelled,
}

struct Inner {
    manifest: Arc<Manifest>,
    graph: ServiceGraph,
    runtime: Arc<dyn ContainerRuntime>,
    builder: ImageBuilder,
    binder: Binder,
    board: Arc<StatusBoard>,
    health: HealthGate,
    instances: Mutex<HashMap<String, Instance>>,
    images: Mutex<HashMap<String, String>>,
    start_order: Mutex<Vec<String>>,
    failures: Arc<std::sync::Mutex<Vec<ServiceFailure>>>,
    /// Exit monitor and health gate of each running service
    tasks: Mutex<HashMap<String, Vec<JoinHandle<()>>>>,
    shutdown: watch::Sender<bool>,
}

/// Drives the services of one manifest
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Create an orchestrator. Fails on a dependency cycle before anything
    /// is built or started.
    pub fn new(
        manifest: Arc<Manifest>,
        runtime: Arc<dyn ContainerRuntime>,
        builder: ImageBuilder,
        binder: Binder,
    ) -> Result<Self> {
        let graph = ServiceGraph::from_manifest(&manifest)?;
        let board = Arc::new(StatusBoard::new(graph.services().map(str::to_string)));
        let failures = Arc::new(std::sync::Mutex::new(Vec::new()));
        let health = HealthGate::new(runtime.clone(), board.clone()).on_exhausted({
            let failures = failures.clone();
            move |error: &MusterError| {
                if let MusterError::HealthExhausted { service, .. } = error {
                    push_failure(&failures, service, error);
                }
            }
        });
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(Inner {
                manifest,
                graph,
                runtime,
                builder,
                binder,
                board,
                health,
                instances: Mutex::new(HashMap::new()),
                images: Mutex::new(HashMap::new()),
                start_order: Mutex::new(Vec::new()),
                failures,
                tasks: Mutex::new(HashMap::new()),
                shutdown,
            }),
        })
    }

    /// Manifest of this run
    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.inner.manifest
    }

    /// Status board of this run
    pub fn board(&self) -> &Arc<StatusBoard> {
        &self.inner.board
    }

    /// Deterministic start plan
    pub fn plan(&self) -> StartPlan {
        self.inner.graph.start_plan()
    }

    /// Services in the order they were (last) started
    pub async fn start_order(&self) -> Vec<String> {
        self.inner.start_order.lock().await.clone()
    }

    /// Running instances, in start order
    pub async fn instances(&self) -> Vec<Instance> {
        let order = self.start_order().await;
        let instances = self.inner.instances.lock().await;
        order
            .iter()
            .filter_map(|name| instances.get(name).cloned())
            .collect()
    }

    /// Receiver that flips to `true` when shutdown begins
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.subscribe()
    }

    /// Build images, then start every service as its dependencies allow.
    /// Returns once every service has started and settled, or was blocked or
    /// failed.
    pub async fn up(&self) -> Result<UpReport> {
        let plan = self.plan();
        tracing::info!(
            "Bringing up {} services for project {}",
            plan.order().len(),
            self.inner.manifest.project
        );

        self.build_images().await?;

        let mut handles = Vec::new();
        for name in plan.order() {
            if self.inner.board.get(name) != Some(ServiceStatus::Pending) {
                continue;
            }
            let this = self.clone();
            let name = name.to_string();
            handles.push(tokio::spawn(async move { this.launch(&name).await }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("Service task ended abnormally: {}", e);
            }
        }

        Ok(self.report().await)
    }

    /// Current report
    pub async fn report(&self) -> UpReport {
        UpReport {
            start_order: self.start_order().await,
            statuses: self.inner.board.snapshot(),
            failures: self.failures(),
        }
    }

    /// Stop everything in reverse start order. Services that never started
    /// are recorded as stopped. Returns the services that were stopped.
    pub async fn down(&self) -> Result<Vec<String>> {
        self.inner.shutdown.send_replace(true);

        let order: Vec<String> = self.start_order().await.into_iter().rev().collect();
        let mut stopped = Vec::new();
        for name in order {
            if self.stop_service(&name).await? {
                stopped.push(name);
            }
        }

        for name in self.inner.manifest.services.keys() {
            if self.inner.board.get(name) == Some(ServiceStatus::Pending) {
                self.set(name, ServiceStatus::Stopped, Some("never started"));
            }
        }

        tracing::info!("Stopped {} services", stopped.len());
        Ok(stopped)
    }

    /// Restart a service, then the dependents that asked to follow it
    /// (`restart: true`).
    pub async fn restart(&self, name: &str) -> Result<()> {
        self.restart_cascade(name, false).await
    }

    /// Rebuild a service's image and restart it. Dependents that require it
    /// healthy are restarted once it is healthy again. On build failure the
    /// running instance is left alone.
    pub async fn rebuild(&self, name: &str) -> Result<BuiltImage> {
        let service = self.inner.manifest.service(name)?;
        if service.build().is_none() {
            return Err(MusterError::manifest(
                format!("services.{}", name),
                "rebuild requires a build section",
            ));
        }

        let image = match self.inner.builder.build_service(service).await {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!("Rebuild of {} failed, keeping the running instance", name);
                return Err(e);
            }
        };
        tracing::info!("Rebuilt {} as {}", name, image.reference);
        self.inner
            .images
            .lock()
            .await
            .insert(name.to_string(), image.reference.clone());

        self.restart_cascade(name, true).await?;
        Ok(image)
    }

    /// Mirror `source` into the running instance of `name` at `target`
    pub async fn sync(&self, name: &str, source: &Path, target: &str) -> Result<()> {
        let instance = self
            .inner
            .instances
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| MusterError::Start {
                service: name.to_string(),
                message: "not running".to_string(),
            })?;
        self.inner.runtime.sync(&instance, source, target).await
    }

    async fn build_images(&self) -> Result<()> {
        let plans = ImageBuilder::plan(&self.inner.manifest, &[])?;
        let mut shutdown = self.shutdown_signal();

        for file in &plans {
            if *shutdown.borrow() {
                break;
            }
            let results = tokio::select! {
                results = self.inner.builder.build(file) => results,
                _ = shutdown.changed() => {
                    tracing::info!("Build interrupted by shutdown");
                    break;
                }
            };
            for (service, result) in results {
                match result {
                    Ok(image) => {
                        tracing::info!("Built {} ({})", service, image.reference);
                        self.inner
                            .images
                            .lock()
                            .await
                            .insert(service, image.reference);
                    }
                    Err(e) => self.fail(&service, ServiceStatus::Failed, e).await,
                }
            }
        }

        Ok(())
    }

    /// Bring one service from `pending` to settled
    async fn launch(&self, name: &str) {
        let Ok(service) = self.inner.manifest.service(name) else {
            return;
        };

        match self.await_dependencies(service).await {
            Gate::Ready => {}
            Gate::Blocked(message) => {
                let error = MusterError::Start {
                    service: name.to_string(),
                    message,
                };
                self.fail(name, ServiceStatus::Blocked, error).await;
                return;
            }
            Gate::Cancelled => {
                self.set(name, ServiceStatus::Stopped, Some("shutdown before start"));
                return;
            }
        }

        if let Err(e) = self.start_service(service).await {
            self.fail(name, ServiceStatus::Failed, e).await;
            return;
        }

        if service.healthcheck.is_some() {
            let mut shutdown = self.shutdown_signal();
            tokio::select! {
                _ = self.inner.board.wait_until(name, |s| s != ServiceStatus::Started) => {}
                _ = shutdown.wait_for(|stop| *stop) => {}
            }
        }
    }

    async fn await_dependencies(&self, service: &Service) -> Gate {
        let mut statuses = self.inner.board.watch();
        let mut shutdown = self.shutdown_signal();

        loop {
            if *shutdown.borrow() {
                return Gate::Cancelled;
            }

            let mut waiting = false;
            {
                let current = statuses.borrow_and_update();
                for dep in self.inner.graph.dependencies(&service.name) {
                    let status = current.get(&dep.service).copied();
                    match status.map(|s| s.check(dep.condition)) {
                        Some(Readiness::Ready) => {}
                        Some(Readiness::Waiting) => waiting = true,
                        _ if !dep.required => {
                            tracing::debug!(
                                "Optional dependency {} of {} will not be {}",
                                dep.service,
                                service.name,
                                dep.condition
                            );
                        }
                        _ => {
                            let state = status
                                .map(|s| s.to_string())
                                .unwrap_or_else(|| "missing".to_string());
                            return Gate::Blocked(format!(
                                "dependency '{}' is {}, needs {}",
                                dep.service, state, dep.condition
                            ));
                        }
                    }
                }
            }

            if !waiting {
                return Gate::Ready;
            }

            tokio::select! {
                changed = statuses.changed() => {
                    if changed.is_err() {
                        return Gate::Cancelled;
                    }
                }
                _ = shutdown.changed() => return Gate::Cancelled,
            }
        }
    }

    async fn start_service(&self, service: &Service) -> Result<()> {
        let name = service.name.as_str();
        let instance = match self.bind_and_start(service).await {
            Ok(instance) => instance,
            Err(e) => {
                if let Err(release) = self.inner.binder.release(name) {
                    tracing::debug!("Could not release {}: {}", name, release);
                }
                return Err(e);
            }
        };

        self.inner
            .instances
            .lock()
            .await
            .insert(name.to_string(), instance.clone());
        {
            let mut order = self.inner.start_order.lock().await;
            order.retain(|s| s != name);
            order.push(name.to_string());
        }

        let mut tasks = vec![self.spawn_exit_monitor(instance.clone())];
        if let Some(probe) = service.healthcheck.clone() {
            tasks.push(self.spawn_health_gate(instance, probe));
        }
        self.inner.tasks.lock().await.insert(name.to_string(), tasks);

        // Shutdown may have begun while the runtime was starting us
        if *self.inner.shutdown.borrow() {
            self.stop_service(name).await?;
        }

        Ok(())
    }

    /// Bind resources and launch the instance, leaving it `started`
    async fn bind_and_start(&self, service: &Service) -> Result<Instance> {
        let name = service.name.as_str();
        let binding = self.inner.binder.bind(service)?;

        let image = match &service.source {
            ImageSource::Image(image) => Some(image.clone()),
            ImageSource::Build(_) => self.inner.images.lock().await.get(name).cloned(),
        };
        let spec = LaunchSpec {
            service: name.to_string(),
            image,
            argv: service.argv(),
            env: service.environment.clone(),
            working_dir: service.working_dir.clone(),
            project_dir: self.inner.manifest.project_dir.clone(),
            binding,
        };

        self.inner
            .board
            .transition(name, ServiceStatus::Starting, None)?;
        let instance = self.inner.runtime.start(&spec).await?;
        tracing::info!("Started service {} ({})", name, instance.id);
        self.inner
            .board
            .transition(name, ServiceStatus::Started, None)?;
        Ok(instance)
    }

    fn spawn_exit_monitor(&self, instance: Instance) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let code = match this.inner.runtime.wait(&instance).await {
                Ok(code) => code,
                Err(e) => {
                    tracing::warn!("Lost track of {}: {}", instance.service, e);
                    return;
                }
            };

            let name = instance.service.as_str();
            {
                let mut instances = this.inner.instances.lock().await;
                if instances.get(name).map(|i| &i.id) != Some(&instance.id) {
                    return;
                }
                let running = this
                    .inner
                    .board
                    .get(name)
                    .map(ServiceStatus::is_running)
                    .unwrap_or(false);
                if !running {
                    return;
                }
                instances.remove(name);
            }

            if code == 0 {
                tracing::info!("Service {} exited", name);
                this.set(name, ServiceStatus::Stopped, Some("exited with code 0"));
            } else {
                let error = MusterError::Start {
                    service: name.to_string(),
                    message: format!("exited with code {}", code),
                };
                this.fail(name, ServiceStatus::Failed, error).await;
            }
        })
    }

    fn spawn_health_gate(&self, instance: Instance, probe: HealthProbe) -> JoinHandle<()> {
        let this = self.clone();
        let shutdown = self.shutdown_signal();
        tokio::spawn(async move {
            let outcome = this.inner.health.run(&instance, &probe, shutdown).await;
            tracing::debug!("Health gate of {} finished: {:?}", instance.service, outcome);
        })
    }

    /// Stop one service. Returns whether a running instance was stopped.
    async fn stop_service(&self, name: &str) -> Result<bool> {
        let grace = self.inner.manifest.service(name)?.stop_grace_period;

        if let Some(tasks) = self.inner.tasks.lock().await.remove(name) {
            for task in tasks {
                task.abort();
            }
        }

        let instance = self.inner.instances.lock().await.remove(name);
        let stopped = match instance {
            Some(instance) => {
                self.set(name, ServiceStatus::Stopping, None);
                tracing::info!("Stopping service {}", name);
                match self.inner.runtime.stop(&instance, grace).await {
                    Ok(()) => self.set(name, ServiceStatus::Stopped, None),
                    Err(e) => self.fail(name, ServiceStatus::Failed, e).await,
                }
                true
            }
            None => {
                if self.inner.board.get(name) == Some(ServiceStatus::Pending) {
                    self.set(name, ServiceStatus::Stopped, Some("never started"));
                }
                false
            }
        };

        self.inner.binder.release(name)?;
        Ok(stopped)
    }

    async fn restart_one(&self, name: &str) -> Result<()> {
        self.stop_service(name).await?;
        self.inner
            .board
            .transition(name, ServiceStatus::Pending, Some("restart".to_string()))?;
        self.launch(name).await;

        match self.inner.board.get(name) {
            Some(status @ (ServiceStatus::Failed | ServiceStatus::Blocked)) => {
                Err(MusterError::Start {
                    service: name.to_string(),
                    message: format!("{} after restart", status),
                })
            }
            _ => Ok(()),
        }
    }

    /// Restart `name`, then dependents with `restart: true` transitively.
    /// With `regate`, dependents requiring `name` healthy follow too, but
    /// only when it came back healthy.
    async fn restart_cascade(&self, name: &str, regate: bool) -> Result<()> {
        self.inner.manifest.service(name)?;
        self.restart_one(name).await?;

        let healthy = self.inner.board.get(name) == Some(ServiceStatus::Healthy);
        let mut queue: VecDeque<String> = VecDeque::new();
        for (dependent, dep) in self.inner.graph.dependents(name) {
            let regated = regate && dep.condition == DependencyCondition::Healthy;
            if regated && !healthy {
                tracing::warn!(
                    "{} is not healthy after restart, leaving {} as it is",
                    name,
                    dependent
                );
                continue;
            }
            if dep.restart || regated {
                queue.push_back(dependent.to_string());
            }
        }

        let mut done = BTreeSet::new();
        while let Some(next) = queue.pop_front() {
            if !done.insert(next.clone()) {
                continue;
            }
            tracing::info!("Restarting {} after {}", next, name);
            if let Err(e) = self.restart_one(&next).await {
                tracing::warn!("{}", e);
                continue;
            }
            for (dependent, dep) in self.inner.graph.dependents(&next) {
                if dep.restart {
                    queue.push_back(dependent.to_string());
                }
            }
        }

        Ok(())
    }

    /// Transition, tolerating moves the lifecycle no longer allows
    fn set(&self, name: &str, to: ServiceStatus, reason: Option<&str>) {
        if let Err(e) = self
            .inner
            .board
            .transition(name, to, reason.map(str::to_string))
        {
            tracing::debug!("{}", e);
        }
    }

    /// Record a failure, then move the service to `to`. Anyone who sees
    /// the new status also sees the failure.
    async fn fail(&self, name: &str, to: ServiceStatus, error: MusterError) {
        tracing::warn!("{}", error);
        self.record(name, &error);
        self.set(name, to, Some(&error.to_string()));
    }

    fn record(&self, name: &str, error: &MusterError) {
        push_failure(&self.inner.failures, name, error);
    }

    fn failures(&self) -> Vec<ServiceFailure> {
        match self.inner.failures.lock() {
            Ok(failures) => failures.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

fn push_failure(
    failures: &std::sync::Mutex<Vec<ServiceFailure>>,
    name: &str,
    error: &MusterError,
) {
    let failure = ServiceFailure::new(name, error);
    match failures.lock() {
        Ok(mut failures) => failures.push(failure),
        Err(poisoned) => poisoned.into_inner().push(failure),
    }
}
