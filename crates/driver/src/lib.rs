//! Drover lifecycle driver: one linear workflow over a managed resource.
//!
//! Create, wait until available, scale, wait until the controller has
//! picked the change up and converged again, then delete. The first
//! failed step aborts the run; there is no partial rollback, cleanup of
//! a half-driven resource is the operator's call.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use drover_core::{ManagedResource, ResourceState, DEFAULT_NAMESPACE};
use drover_events::{spawn_logger, EventSource};
use drover_store::ResourceStore;
use drover_wait::{wait_for_state, WaitParams};

/// Knobs for one workflow run, passed in at construction. There is no
/// process-wide configuration state.
#[derive(Debug, Clone, Copy)]
pub struct DriverConfig {
    /// Budget for each convergence wait.
    pub timeout: Duration,
    /// Sleep between status reads while waiting.
    pub poll_interval: Duration,
    /// Replica count applied by the scale step.
    pub target_replicas: i32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30 * 60),
            poll_interval: Duration::from_secs(5),
            target_replicas: 2,
        }
    }
}

impl DriverConfig {
    fn wait_params(&self) -> WaitParams {
        WaitParams {
            timeout: self.timeout,
            poll_interval: self.poll_interval,
        }
    }
}

/// Drives one managed resource through its full lifecycle.
pub struct LifecycleDriver<S> {
    store: S,
    events: Option<Arc<dyn EventSource>>,
    cfg: DriverConfig,
}

impl<S: ResourceStore> LifecycleDriver<S> {
    pub fn new(store: S, cfg: DriverConfig) -> Self {
        Self { store, events: None, cfg }
    }

    /// Attach a notification source. Best-effort: a subscription failure
    /// is logged and the workflow carries on without events.
    pub fn with_events(mut self, events: Arc<dyn EventSource>) -> Self {
        self.events = Some(events);
        self
    }

    pub async fn run(&self, manifest: ManagedResource) -> Result<()> {
        let mut desired = manifest;
        if desired.metadata.namespace.is_empty() {
            desired.metadata.namespace = DEFAULT_NAMESPACE.to_string();
        }

        let created = self
            .store
            .create(&desired)
            .await
            .with_context(|| format!("creating {}/{}", desired.metadata.namespace, desired.metadata.name))?;
        let id = created.identity();
        info!(resource = %id, uid = %id.uid, "resource created");

        self.observe(&id).await;

        let params = self.cfg.wait_params();
        wait_for_state(&self.store, &id, ResourceState::Available, params)
            .await
            .with_context(|| format!("waiting for {} to become available", id))?;
        info!(resource = %id, "resource is available");

        let mut current = self
            .store
            .get(&id.name, &id.namespace)
            .await
            .with_context(|| format!("reading {} before scaling", id))?;
        current.spec.replicas = Some(self.cfg.target_replicas);
        self.store
            .update(&current)
            .await
            .with_context(|| format!("scaling {} to {} replicas", id, self.cfg.target_replicas))?;
        info!(resource = %id, replicas = self.cfg.target_replicas, "resource is scaling");

        // A controller that passes through Creating faster than one poll
        // interval is never observed here and the wait times out. There
        // is no debounce.
        wait_for_state(&self.store, &id, ResourceState::Creating, params)
            .await
            .with_context(|| format!("waiting for {} to start reconciling the scale", id))?;
        wait_for_state(&self.store, &id, ResourceState::Available, params)
            .await
            .with_context(|| format!("waiting for {} to become available after scaling", id))?;
        info!(resource = %id, replicas = self.cfg.target_replicas, "resource scaled");

        self.store
            .delete(&id.name, &id.namespace)
            .await
            .with_context(|| format!("deleting {}", id))?;
        info!(resource = %id, "resource deleted");
        Ok(())
    }

    /// Fire-and-forget event logging for the created identity. Never
    /// joined on the success path; process exit reaps the task.
    async fn observe(&self, id: &drover_core::ResourceIdentity) {
        let Some(events) = &self.events else { return };
        match events.subscribe(id).await {
            Ok(handle) => {
                let _task = spawn_logger(handle);
            }
            Err(e) => {
                warn!(resource = %id, error = %e, "event subscription failed; continuing without events");
            }
        }
    }
}
