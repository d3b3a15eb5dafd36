//! Drover convergence waiter: poll the store until a status predicate holds.

#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use metrics::counter;
use tracing::info;

use drover_core::{ManagedResource, ResourceIdentity, ResourceState, ResourceStatus, WaitError};
use drover_store::ResourceStore;

/// Timing budget for one convergence wait. `poll_interval` must be
/// smaller than `timeout`; the first read always happens before the
/// first sleep, so at least one check runs even with a tiny budget.
#[derive(Debug, Clone, Copy)]
pub struct WaitParams {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for WaitParams {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30 * 60),
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Poll the store until `pred` holds for the resource's status.
///
/// A read failure aborts immediately with the store error; it is never
/// reported as a timeout. A resource that already satisfies `pred`
/// returns without sleeping. `target` labels progress logs and the
/// timeout error, nothing else.
pub async fn wait_until<P>(
    store: &dyn ResourceStore,
    id: &ResourceIdentity,
    target: &str,
    pred: P,
    params: WaitParams,
) -> Result<ManagedResource, WaitError>
where
    P: Fn(&ResourceStatus) -> bool,
{
    let deadline = Instant::now() + params.timeout;
    loop {
        counter!("drover_convergence_polls", 1u64);
        let resource = store.get(&id.name, &id.namespace).await?;
        if pred(&resource.status) {
            return Ok(resource);
        }
        let state = &resource.status.state;
        if !state.is_unset() {
            // An unset state means the controller has not reported yet.
            info!(resource = %id, state = %state, target = %target, "not yet converged");
        }
        tokio::time::sleep(params.poll_interval).await;
        if Instant::now() >= deadline {
            counter!("drover_convergence_timeouts", 1u64);
            return Err(WaitError::Timeout(format!(
                "{} did not reach {} within {:?}",
                id, target, params.timeout
            )));
        }
    }
}

/// Wait until the observed state equals `state`.
pub async fn wait_for_state(
    store: &dyn ResourceStore,
    id: &ResourceIdentity,
    state: ResourceState,
    params: WaitParams,
) -> Result<ManagedResource, WaitError> {
    let target = state.as_str().to_string();
    wait_until(store, id, &target, |status| status.state == state, params).await
}
