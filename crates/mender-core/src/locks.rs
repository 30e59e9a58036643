//! Per-file mutual exclusion.
//!
//! A request names every file a fix will touch. The whole set is enqueued in
//! one step, in lexicographic path order, and granted all-or-nothing once the
//! request is at the head of every file's FIFO queue and no file has a holder.
//! Tickets are monotonic and enqueued atomically, so every queue is ordered by
//! ticket and the oldest waiting request can always make progress.
//! Paths are keyed in normalized form, so `./src/a.ts` and `src/a.ts` share
//! one lock.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::bus::{BusEvent, MessageBus};
use crate::domain::normalize_path;
use crate::error::FixError;
use crate::metrics::METRICS;
use crate::obs;

/// Bounded wait on a lock set expired.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("lock on {path:?} not acquired within {waited_ms}ms (blocked by {holder:?})")]
pub struct LockTimeoutError {
    pub path: PathBuf,
    /// Holder, or the request queued ahead, at the moment the wait expired.
    pub holder: Option<String>,
    pub waited_ms: u64,
}

impl From<LockTimeoutError> for FixError {
    fn from(e: LockTimeoutError) -> Self {
        FixError::LockTimeout {
            path: e.path,
            holder: e.holder,
            waited_ms: e.waited_ms,
        }
    }
}

fn lock_key(path: PathBuf) -> PathBuf {
    normalize_path(&path).unwrap_or(path)
}

#[derive(Debug, Clone)]
struct Ticket {
    id: u64,
    label: String,
}

#[derive(Debug, Default)]
struct FileLock {
    holder: Option<Ticket>,
    waiters: VecDeque<Ticket>,
}

#[derive(Debug, Default)]
struct LockTable {
    files: HashMap<PathBuf, FileLock>,
    next_ticket: u64,
}

impl LockTable {
    fn enqueue(&mut self, label: &str, paths: &BTreeSet<PathBuf>) -> u64 {
        self.next_ticket += 1;
        let ticket = Ticket {
            id: self.next_ticket,
            label: label.to_string(),
        };
        for path in paths {
            self.files
                .entry(path.clone())
                .or_default()
                .waiters
                .push_back(ticket.clone());
        }
        ticket.id
    }

    /// First file blocking `ticket`, with whoever blocks it.
    fn blocker(&self, ticket: u64, paths: &BTreeSet<PathBuf>) -> Option<(PathBuf, Option<String>)> {
        for path in paths {
            let Some(lock) = self.files.get(path) else {
                continue;
            };
            if let Some(holder) = &lock.holder {
                return Some((path.clone(), Some(holder.label.clone())));
            }
            match lock.waiters.front() {
                Some(head) if head.id != ticket => {
                    return Some((path.clone(), Some(head.label.clone())));
                }
                _ => {}
            }
        }
        None
    }

    /// Caller has checked `blocker` is `None`, so the head of every queue
    /// is the granted request.
    fn grant(&mut self, paths: &BTreeSet<PathBuf>) {
        for path in paths {
            if let Some(lock) = self.files.get_mut(path) {
                if let Some(t) = lock.waiters.pop_front() {
                    lock.holder = Some(t);
                }
            }
        }
    }

    fn cancel(&mut self, ticket: u64, paths: &BTreeSet<PathBuf>) {
        for path in paths {
            if let Some(lock) = self.files.get_mut(path) {
                lock.waiters.retain(|w| w.id != ticket);
            }
        }
        self.prune(paths);
    }

    fn release(&mut self, ticket: u64, paths: &BTreeSet<PathBuf>) {
        for path in paths {
            if let Some(lock) = self.files.get_mut(path) {
                if lock.holder.as_ref().is_some_and(|h| h.id == ticket) {
                    lock.holder = None;
                }
            }
        }
        self.prune(paths);
    }

    fn prune(&mut self, paths: &BTreeSet<PathBuf>) {
        for path in paths {
            if self
                .files
                .get(path)
                .is_some_and(|l| l.holder.is_none() && l.waiters.is_empty())
            {
                self.files.remove(path);
            }
        }
    }
}

struct LockInner {
    table: Mutex<LockTable>,
    released: Notify,
    bus: Option<MessageBus>,
}

impl LockInner {
    fn table(&self) -> MutexGuard<'_, LockTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Lock manager for the working tree. Cheap to clone.
#[derive(Clone)]
pub struct ConflictDetector {
    inner: Arc<LockInner>,
}

impl Default for ConflictDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ConflictDetector {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Publish `ConflictDetected` on `bus` whenever a request has to wait.
    pub fn with_bus(bus: MessageBus) -> Self {
        Self::build(Some(bus))
    }

    fn build(bus: Option<MessageBus>) -> Self {
        Self {
            inner: Arc::new(LockInner {
                table: Mutex::new(LockTable::default()),
                released: Notify::new(),
                bus,
            }),
        }
    }

    /// Acquire every path for `label`, waiting at most `timeout`.
    ///
    /// Dropping the returned future before it resolves withdraws the request.
    pub async fn acquire<I, P>(
        &self,
        label: &str,
        paths: I,
        timeout: Duration,
    ) -> Result<LockGuard, LockTimeoutError>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let paths: BTreeSet<PathBuf> = paths.into_iter().map(|p| lock_key(p.into())).collect();
        let started = Instant::now();
        let deadline = started + timeout;

        let ticket = self.inner.table().enqueue(label, &paths);
        let mut request = PendingRequest {
            inner: &self.inner,
            ticket,
            paths: &paths,
            armed: true,
        };
        let mut reported = false;

        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let blocked = {
                let mut table = self.inner.table();
                match table.blocker(ticket, &paths) {
                    None => {
                        table.grant(&paths);
                        None
                    }
                    Some(b) => Some(b),
                }
            };

            let Some((path, holder)) = blocked else {
                request.armed = false;
                drop(request);
                return Ok(LockGuard {
                    inner: Arc::clone(&self.inner),
                    ticket,
                    paths,
                    label: label.to_string(),
                });
            };

            if !reported {
                reported = true;
                self.report_contention(label, &path, holder.as_deref());
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let (path, holder) = self
                    .inner
                    .table()
                    .blocker(ticket, &paths)
                    .unwrap_or((path, holder));
                return Err(LockTimeoutError {
                    path,
                    holder,
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
        }
    }

    /// Grant immediately if nothing holds or waits on any path.
    pub fn try_acquire<I, P>(&self, label: &str, paths: I) -> Option<LockGuard>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let paths: BTreeSet<PathBuf> = paths.into_iter().map(|p| lock_key(p.into())).collect();
        let mut table = self.inner.table();
        if paths.iter().any(|p| table.files.contains_key(p)) {
            return None;
        }
        let ticket = table.enqueue(label, &paths);
        table.grant(&paths);
        Some(LockGuard {
            inner: Arc::clone(&self.inner),
            ticket,
            paths,
            label: label.to_string(),
        })
    }

    pub fn holder_of(&self, path: &Path) -> Option<String> {
        self.inner
            .table()
            .files
            .get(&lock_key(path.to_path_buf()))
            .and_then(|l| l.holder.as_ref().map(|h| h.label.clone()))
    }

    /// Snapshot of `path → holder` for every held file.
    pub fn holders(&self) -> BTreeMap<PathBuf, String> {
        self.inner
            .table()
            .files
            .iter()
            .filter_map(|(p, l)| l.holder.as_ref().map(|h| (p.clone(), h.label.clone())))
            .collect()
    }

    /// Number of requests queued on `path` (excluding the holder).
    pub fn waiting(&self, path: &Path) -> usize {
        self.inner
            .table()
            .files
            .get(&lock_key(path.to_path_buf()))
            .map_or(0, |l| l.waiters.len())
    }

    pub fn is_idle(&self) -> bool {
        self.inner.table().files.is_empty()
    }

    fn report_contention(&self, requester: &str, path: &Path, holder: Option<&str>) {
        METRICS.inc_lock_conflicts();
        obs::emit_lock_contended(path, requester, holder);
        if let Some(bus) = &self.inner.bus {
            bus.publish(BusEvent::ConflictDetected {
                path: path.to_path_buf(),
                requester: requester.to_string(),
                holder: holder.map(str::to_string),
            });
        }
    }
}

/// Withdraws a queued request unless it was granted.
struct PendingRequest<'a> {
    inner: &'a LockInner,
    ticket: u64,
    paths: &'a BTreeSet<PathBuf>,
    armed: bool,
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.table().cancel(self.ticket, self.paths);
            self.inner.released.notify_waiters();
        }
    }
}

/// Held lock set; released on drop.
#[derive(Debug)]
pub struct LockGuard {
    inner: Arc<LockInner>,
    ticket: u64,
    paths: BTreeSet<PathBuf>,
    label: String,
}

impl LockGuard {
    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.paths.iter()
    }

    pub fn covers(&self, path: &Path) -> bool {
        self.paths.contains(path)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn release(self) {}
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.inner.table().release(self.ticket, &self.paths);
        self.inner.released.notify_waiters();
    }
}

impl std::fmt::Debug for LockInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockInner").finish_non_exhaustive()
    }
}
