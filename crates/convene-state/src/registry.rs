//! In-process handle registry
//!
//! `HandleRegistry` is the single source of truth for handle existence and
//! state. All terminal transitions go through it; readers observe changes
//! through a per-handle `watch` channel instead of polling.
//!
//! Guarantees:
//! - A handle id is unique among live (not yet purged) handles.
//! - Terminal states are write-once: a second transition fails with
//!   `RegistryError::AlreadyResolved` and leaves the stored outcome untouched.
//! - Deadlines are enforced lazily: any read or write that observes a pending
//!   handle, or one of its ancestors, past its deadline moves it to `TimedOut`
//!   first.
//! - A terminal transition cancels every still-pending descendant handle.
//! - A timeout too large for either clock means no deadline.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{RegistryError, RegistryResult};
use crate::handle::*;

#[derive(Debug)]
struct Entry {
    snapshot: HandleSnapshot,
    deadline_at: Option<Instant>,
    resolved_at: Option<Instant>,
    status_tx: watch::Sender<HandleStatus>,
    cancel: CancellationToken,
    children: Vec<HandleId>,
}

impl Entry {
    fn is_due(&self, now: Instant) -> bool {
        !self.snapshot.is_terminal() && self.deadline_at.is_some_and(|d| now >= d)
    }
}

/// Live subscription to a single handle.
#[derive(Debug)]
pub struct HandleWatch {
    /// State at subscription time (after deadline evaluation)
    pub snapshot: HandleSnapshot,
    /// Receives every status transition after subscription
    pub status_rx: watch::Receiver<HandleStatus>,
    /// Earliest monotonic deadline of the handle and its pending ancestors
    pub deadline: Option<Instant>,
}

/// Concurrency-safe in-memory registry of wait handles.
#[derive(Debug, Default)]
pub struct HandleRegistry {
    entries: Mutex<HashMap<HandleId, Entry>>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending handle.
    ///
    /// Fails with `DuplicateId` if the id is live, or `NotFound` if the
    /// requested parent does not exist. A child of an already-terminal parent
    /// is born cancelled.
    pub fn create(&self, spec: HandleSpec) -> RegistryResult<HandleSnapshot> {
        let id = spec.id.unwrap_or_default();
        let now = Instant::now();
        let mut entries = self.entries.lock();

        if entries.contains_key(&id) {
            return Err(RegistryError::DuplicateId { id });
        }

        let (cancel, parent_resolved) = match &spec.parent {
            Some(parent_id) => {
                expire_if_due(&mut entries, parent_id, now);
                let parent = entries
                    .get(parent_id)
                    .ok_or_else(|| RegistryError::NotFound {
                        id: parent_id.clone(),
                    })?;
                (parent.cancel.child_token(), parent.snapshot.is_terminal())
            }
            None => (CancellationToken::new(), false),
        };

        let created_at = Utc::now();
        let timeout_ms = spec
            .timeout
            .map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX));
        let deadlines = spec.timeout.and_then(|t| {
            let at = now.checked_add(t)?;
            let wall = chrono::Duration::from_std(t)
                .ok()
                .and_then(|d| created_at.checked_add_signed(d))?;
            Some((at, wall))
        });
        if spec.timeout.is_some() && deadlines.is_none() {
            debug!(handle_id = %id, timeout_ms = ?timeout_ms, "timeout out of range, handle has no deadline");
        }

        let parent = spec.parent;
        let snapshot = HandleSnapshot {
            id: id.clone(),
            kind: spec.kind,
            status: HandleStatus::Pending,
            created_at,
            completed_at: None,
            deadline: deadlines.map(|(_, wall)| wall),
            timeout_ms,
            parent: parent.clone(),
            result: None,
            error: None,
            metadata: spec.metadata,
        };
        let (status_tx, _) = watch::channel(HandleStatus::Pending);

        entries.insert(
            id.clone(),
            Entry {
                snapshot,
                deadline_at: deadlines.map(|(at, _)| at),
                resolved_at: None,
                status_tx,
                cancel,
                children: Vec::new(),
            },
        );
        if let Some(parent) = parent.as_ref().and_then(|p| entries.get_mut(p)) {
            parent.children.push(id.clone());
        }
        debug!(handle_id = %id, kind = %spec.kind, timeout_ms = ?timeout_ms, "handle created");

        if parent_resolved {
            resolve(&mut entries, &id, HandleStatus::Cancelled, None, None, now)?;
        }

        snapshot_of(&entries, &id)
    }

    /// Fetch a handle's current state.
    pub fn get(&self, id: &HandleId) -> RegistryResult<HandleSnapshot> {
        let mut entries = self.entries.lock();
        expire_if_due(&mut entries, id, Instant::now());
        snapshot_of(&entries, id)
    }

    /// Resolve a pending handle successfully.
    pub fn complete(
        &self,
        id: &HandleId,
        result: serde_json::Value,
    ) -> RegistryResult<HandleSnapshot> {
        let mut entries = self.entries.lock();
        resolve(
            &mut entries,
            id,
            HandleStatus::Completed,
            Some(result),
            None,
            Instant::now(),
        )
    }

    /// Resolve a pending handle as failed.
    pub fn fail(&self, id: &HandleId, failure: HandleFailure) -> RegistryResult<HandleSnapshot> {
        let mut entries = self.entries.lock();
        resolve(
            &mut entries,
            id,
            HandleStatus::Failed,
            None,
            Some(failure),
            Instant::now(),
        )
    }

    /// Cancel a pending handle and trip its cancellation token.
    ///
    /// Still-pending descendants are cancelled with it. Cancelled handles
    /// carry neither a result nor an error.
    pub fn cancel(&self, id: &HandleId) -> RegistryResult<HandleSnapshot> {
        let mut entries = self.entries.lock();
        resolve(
            &mut entries,
            id,
            HandleStatus::Cancelled,
            None,
            None,
            Instant::now(),
        )
    }

    /// Snapshot every handle matching `filter`, oldest first.
    ///
    /// Intended for observability; never branch on it.
    pub fn list(&self, filter: HandleFilter) -> Vec<HandleSnapshot> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let due: Vec<HandleId> = entries
            .iter()
            .filter(|(_, e)| e.is_due(now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &due {
            expire_if_due(&mut entries, id, now);
        }

        let mut out: Vec<HandleSnapshot> = entries
            .values()
            .map(|e| &e.snapshot)
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out
    }

    /// Subscribe to status transitions of a handle.
    ///
    /// The watch deadline is the earliest one among the handle and its pending
    /// ancestors, since an expiring ancestor cancels the handle.
    pub fn subscribe(&self, id: &HandleId) -> RegistryResult<HandleWatch> {
        let mut entries = self.entries.lock();
        expire_if_due(&mut entries, id, Instant::now());
        let deadline = lineage(&entries, id)
            .iter()
            .filter_map(|h| entries.get(h))
            .filter(|e| !e.snapshot.is_terminal())
            .filter_map(|e| e.deadline_at)
            .min();
        let entry = entries
            .get(id)
            .ok_or_else(|| RegistryError::NotFound { id: id.clone() })?;
        Ok(HandleWatch {
            snapshot: entry.snapshot.clone(),
            status_rx: entry.status_tx.subscribe(),
            deadline,
        })
    }

    /// Cancellation token tripped when the handle is cancelled, times out, or
    /// otherwise resolves. Workers poll it for cooperative cancellation.
    pub fn cancellation_token(&self, id: &HandleId) -> RegistryResult<CancellationToken> {
        let entries = self.entries.lock();
        entries
            .get(id)
            .map(|e| e.cancel.clone())
            .ok_or_else(|| RegistryError::NotFound { id: id.clone() })
    }

    /// Remove terminal handles resolved more than `retention` ago.
    ///
    /// Returns the number of purged handles. Purged ids may be reused.
    pub fn purge_resolved(&self, retention: Duration) -> usize {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, e| match e.resolved_at {
            Some(at) => now.saturating_duration_since(at) < retention,
            None => true,
        });
        let purged = before - entries.len();
        if purged > 0 {
            let live: HashSet<HandleId> = entries.keys().cloned().collect();
            for entry in entries.values_mut() {
                entry.children.retain(|c| live.contains(c));
            }
            debug!(purged, remaining = entries.len(), "purged resolved handles");
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

fn snapshot_of(entries: &HashMap<HandleId, Entry>, id: &HandleId) -> RegistryResult<HandleSnapshot> {
    entries
        .get(id)
        .map(|e| e.snapshot.clone())
        .ok_or_else(|| RegistryError::NotFound { id: id.clone() })
}

/// `id` followed by its ancestors, nearest first.
fn lineage(entries: &HashMap<HandleId, Entry>, id: &HandleId) -> Vec<HandleId> {
    let mut chain: Vec<HandleId> = Vec::new();
    let mut next = Some(id.clone());
    while let Some(current) = next {
        if chain.contains(&current) {
            break;
        }
        next = entries.get(&current).and_then(|e| e.snapshot.parent.clone());
        chain.push(current);
    }
    chain
}

/// Expire `id` and every ancestor past its deadline, earliest deadline first.
/// An expired ancestor cancels the handle rather than letting it time out.
fn expire_if_due(entries: &mut HashMap<HandleId, Entry>, id: &HandleId, now: Instant) {
    let mut due: Vec<(Instant, HandleId)> = lineage(entries, id)
        .into_iter()
        .filter_map(|h| {
            let entry = entries.get(&h).filter(|e| e.is_due(now))?;
            entry.deadline_at.map(|at| (at, h))
        })
        .collect();
    due.sort();
    for (_, h) in due {
        expire(entries, &h, now);
    }
}

fn expire(entries: &mut HashMap<HandleId, Entry>, id: &HandleId, now: Instant) {
    let timeout_ms = match entries.get(id) {
        Some(entry) if entry.is_due(now) => entry.snapshot.timeout_ms.unwrap_or(0),
        _ => return,
    };
    // Cannot fail: the entry exists and is pending.
    let _ = apply(
        entries,
        id,
        HandleStatus::TimedOut,
        None,
        Some(HandleFailure::DeadlineExceeded { timeout_ms }),
        now,
    );
}

fn resolve(
    entries: &mut HashMap<HandleId, Entry>,
    id: &HandleId,
    status: HandleStatus,
    result: Option<serde_json::Value>,
    error: Option<HandleFailure>,
    now: Instant,
) -> RegistryResult<HandleSnapshot> {
    expire_if_due(entries, id, now);
    apply(entries, id, status, result, error, now)
}

fn apply(
    entries: &mut HashMap<HandleId, Entry>,
    id: &HandleId,
    status: HandleStatus,
    result: Option<serde_json::Value>,
    error: Option<HandleFailure>,
    now: Instant,
) -> RegistryResult<HandleSnapshot> {
    let entry = entries
        .get_mut(id)
        .ok_or_else(|| RegistryError::NotFound { id: id.clone() })?;
    if entry.snapshot.is_terminal() {
        return Err(RegistryError::AlreadyResolved {
            id: id.clone(),
            status: entry.snapshot.status,
        });
    }

    entry.snapshot.status = status;
    entry.snapshot.result = result;
    entry.snapshot.error = error;
    entry.snapshot.completed_at = Some(Utc::now());
    entry.resolved_at = Some(now);
    entry.status_tx.send_replace(status);
    entry.cancel.cancel();
    let snapshot = entry.snapshot.clone();
    debug!(handle_id = %id, status = %status, "handle resolved");

    cancel_descendants(entries, id, now);
    Ok(snapshot)
}

/// Cancel the pending descendants of a handle that just resolved.
///
/// Only newly cancelled children are descended into: a child that was already
/// terminal cancelled its own subtree when it resolved.
fn cancel_descendants(entries: &mut HashMap<HandleId, Entry>, root: &HandleId, now: Instant) {
    let mut frontier = vec![root.clone()];
    while let Some(parent) = frontier.pop() {
        let children = entries
            .get(&parent)
            .map(|e| e.children.clone())
            .unwrap_or_default();
        for child in children {
            let Some(entry) = entries.get_mut(&child) else {
                continue;
            };
            if entry.snapshot.parent.as_ref() != Some(&parent) || entry.snapshot.is_terminal() {
                continue;
            }
            entry.snapshot.status = HandleStatus::Cancelled;
            entry.snapshot.error = None;
            entry.snapshot.completed_at = Some(Utc::now());
            entry.resolved_at = Some(now);
            entry.status_tx.send_replace(HandleStatus::Cancelled);
            entry.cancel.cancel();
            debug!(handle_id = %child, parent = %parent, "descendant cancelled");
            frontier.push(child);
        }
    }
}
