//! Background execution of units of work bound to wait handles.
//!
//! [`TaskDispatcher::dispatch`] spawns the work and returns at once. When the
//! work finishes, its outcome is written into exactly one handle:
//! `Ok(value)` completes it, `Err(e)` or a panic fails it. Nothing the work
//! does can escape the spawned task.
//!
//! The work is raced against the handle's cancellation token and deadline.
//! If either wins, the work future is dropped and the registry state (set by
//! `cancel` or by deadline expiry) stands.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use convene_state::{HandleFailure, HandleId, HandleRegistry, RegistryError, RegistryResult};

use crate::metrics::METRICS;
use crate::obs;

/// Runs units of work in the background and reports them into handles.
#[derive(Debug, Clone)]
pub struct TaskDispatcher {
    registry: Arc<HandleRegistry>,
    tracker: TaskTracker,
}

impl TaskDispatcher {
    pub fn new(registry: Arc<HandleRegistry>) -> Self {
        Self {
            registry,
            tracker: TaskTracker::new(),
        }
    }

    pub fn registry(&self) -> &Arc<HandleRegistry> {
        &self.registry
    }

    /// Spawn `work` and report its outcome into handle `id`.
    ///
    /// Fails synchronously with `NotFound` or `AlreadyResolved` if the handle
    /// cannot accept an outcome; otherwise never fails.
    pub fn dispatch<Fut, T, E>(&self, id: &HandleId, work: Fut) -> RegistryResult<()>
    where
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Serialize + Send + 'static,
        E: Into<HandleFailure> + Send + 'static,
    {
        self.dispatch_with_token(id, move |_| work)
    }

    /// Like [`dispatch`](Self::dispatch), but hands the work the handle's
    /// cancellation token so it can stop cooperatively or cascade the
    /// cancellation into work it spawns itself.
    pub fn dispatch_with_token<F, Fut, T, E>(&self, id: &HandleId, work: F) -> RegistryResult<()>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Serialize + Send + 'static,
        E: Into<HandleFailure> + Send + 'static,
    {
        let watch = self.registry.subscribe(id)?;
        if watch.snapshot.is_terminal() {
            return Err(RegistryError::AlreadyResolved {
                id: id.clone(),
                status: watch.snapshot.status,
            });
        }
        let token = self.registry.cancellation_token(id)?;
        let work = work(token.clone());

        let registry = Arc::clone(&self.registry);
        let id = id.clone();
        let deadline = watch.deadline;
        METRICS.inc_tasks_dispatched();
        debug!(handle_id = %id, "work dispatched");

        self.tracker.spawn(async move {
            let expiry = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!(handle_id = %id, "work abandoned after cancellation");
                    return;
                }
                _ = expiry => {
                    // Reading past the deadline moves the handle to timed_out.
                    let status = registry.get(&id).map(|s| s.status);
                    debug!(handle_id = %id, status = ?status, "work abandoned at deadline");
                    return;
                }
                outcome = AssertUnwindSafe(work).catch_unwind() => outcome,
            };

            let reported = match outcome {
                Ok(Ok(value)) => match serde_json::to_value(value) {
                    Ok(value) => registry.complete(&id, value),
                    Err(e) => registry.fail(
                        &id,
                        HandleFailure::work(format!("result is not serializable: {e}")),
                    ),
                },
                Ok(Err(err)) => registry.fail(&id, err.into()),
                Err(panic) => registry.fail(
                    &id,
                    HandleFailure::Panicked {
                        message: panic_message(panic.as_ref()),
                    },
                ),
            };

            match reported {
                Ok(snapshot) => obs::emit_handle_resolved(&id, snapshot.status),
                Err(RegistryError::AlreadyResolved { status, .. }) => {
                    debug!(handle_id = %id, status = %status, "late outcome discarded");
                }
                Err(e) => warn!(handle_id = %id, error = %e, "failed to record outcome"),
            }
        });
        Ok(())
    }

    /// Number of dispatched tasks still running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Wait until every task dispatched so far has finished.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
