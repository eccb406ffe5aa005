//! Correlation of in-flight commands with their results.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Sleep;

use crate::backpressure::BackpressureGuard;
use crate::error::{RenderwireError, Result};
use crate::protocol::RenderResult;

type Completion = oneshot::Sender<Result<RenderResult>>;

struct Entry {
    completion: Completion,
    submitted: Instant,
    deadline: Instant,
    _slot: Option<BackpressureGuard>,
}

/// `command_id -> completion` table.
///
/// Every entry leaves the table exactly once: completed by a result, failed
/// by the send path, expired, cancelled on shutdown, or forgotten when its
/// handle is dropped. Completions are sent after the table lock is released.
#[derive(Default)]
pub(crate) struct PendingTable {
    entries: Mutex<HashMap<u64, Entry>>,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    unmatched: AtomicU64,
    round_trip_us: AtomicU64,
}

impl PendingTable {
    pub(crate) fn register(
        self: &Arc<Self>,
        command_id: u64,
        timeout: Duration,
        slot: Option<BackpressureGuard>,
    ) -> PendingResult {
        let (completion, rx) = oneshot::channel();
        let submitted = Instant::now();
        self.entries.lock().insert(
            command_id,
            Entry {
                completion,
                submitted,
                deadline: submitted + timeout,
                _slot: slot,
            },
        );
        PendingResult {
            command_id,
            state: State::Waiting {
                rx,
                deadline: Box::pin(tokio::time::sleep(timeout)),
                table: self.clone(),
            },
        }
    }

    fn take(&self, command_id: u64) -> Option<Entry> {
        self.entries.lock().remove(&command_id)
    }

    /// Hand `result` to the waiting handle. Returns `false` for a late or
    /// unknown result, which is dropped.
    pub(crate) fn complete(&self, result: RenderResult) -> bool {
        let command_id = result.command_id;
        let Some(entry) = self.take(command_id) else {
            self.unmatched.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(command_id, "dropping unmatched result");
            return false;
        };

        let elapsed = entry.submitted.elapsed();
        self.round_trip_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Relaxed);
        let _ = entry.completion.send(Ok(result));
        true
    }

    /// Reject a pending command, typically because no channel took it.
    pub(crate) fn fail(&self, command_id: u64, error: RenderwireError) -> bool {
        let Some(entry) = self.take(command_id) else {
            return false;
        };
        self.failed.fetch_add(1, Ordering::Relaxed);
        let _ = entry.completion.send(Err(error));
        true
    }

    fn time_out(&self, command_id: u64) -> bool {
        let Some(entry) = self.take(command_id) else {
            return false;
        };
        self.timed_out.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(command_id, "command timed out");
        let _ = entry
            .completion
            .send(Err(RenderwireError::Timeout { command_id }));
        true
    }

    /// Expire every entry whose deadline is at or before `now`.
    pub(crate) fn expire(&self, now: Instant) -> usize {
        let expired: Vec<u64> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired.into_iter().filter(|id| self.time_out(*id)).count()
    }

    /// Reject everything still pending with `Shutdown`.
    pub(crate) fn cancel_all(&self) -> usize {
        let drained: Vec<Entry> = self.entries.lock().drain().map(|(_, e)| e).collect();
        let count = drained.len();
        for entry in drained {
            let _ = entry.completion.send(Err(RenderwireError::Shutdown));
        }
        count
    }

    fn forget(&self, command_id: u64) {
        self.take(command_id);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub(crate) fn contains(&self, command_id: u64) -> bool {
        self.entries.lock().contains_key(&command_id)
    }

    pub(crate) fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub(crate) fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub(crate) fn timed_out(&self) -> u64 {
        self.timed_out.load(Ordering::Relaxed)
    }

    pub(crate) fn unmatched(&self) -> u64 {
        self.unmatched.load(Ordering::Relaxed)
    }

    /// Mean round trip of completed commands, in milliseconds.
    pub(crate) fn average_round_trip_ms(&self) -> f64 {
        let completed = self.completed();
        if completed == 0 {
            return 0.0;
        }
        self.round_trip_us.load(Ordering::Relaxed) as f64 / completed as f64 / 1000.0
    }
}

enum State {
    Waiting {
        rx: oneshot::Receiver<Result<RenderResult>>,
        deadline: Pin<Box<Sleep>>,
        table: Arc<PendingTable>,
    },
    Ready(Option<Result<RenderResult>>),
}

/// Handle to the eventual result of a submitted command.
///
/// Resolves to the worker's [`RenderResult`], to `Timeout` once the deadline
/// passes, or to the transport error that prevented sending. Dropping the
/// handle abandons the command; a result arriving later is discarded.
pub struct PendingResult {
    command_id: u64,
    state: State,
}

impl PendingResult {
    /// A handle that is already resolved, for commands rejected before
    /// reaching the table.
    pub(crate) fn ready(command_id: u64, outcome: Result<RenderResult>) -> Self {
        Self {
            command_id,
            state: State::Ready(Some(outcome)),
        }
    }

    /// Id assigned to the command at submission.
    pub fn command_id(&self) -> u64 {
        self.command_id
    }
}

impl Future for PendingResult {
    type Output = Result<RenderResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let command_id = self.command_id;
        let this = &mut *self;

        let outcome = match &mut this.state {
            State::Ready(outcome) => {
                return Poll::Ready(outcome.take().unwrap_or_else(|| {
                    Err(RenderwireError::InvalidState(format!(
                        "result for command {command_id} already taken"
                    )))
                }))
            }
            State::Waiting {
                rx,
                deadline,
                table,
            } => {
                if let Poll::Ready(received) = Pin::new(rx).poll(cx) {
                    Some(received.unwrap_or(Err(RenderwireError::Shutdown)))
                } else if deadline.as_mut().poll(cx).is_ready() && table.time_out(command_id) {
                    Some(Err(RenderwireError::Timeout { command_id }))
                } else {
                    // Either still waiting, or a completion won the race for
                    // the entry and its send will wake `rx`.
                    None
                }
            }
        };

        match outcome {
            Some(outcome) => {
                this.state = State::Ready(None);
                Poll::Ready(outcome)
            }
            None => Poll::Pending,
        }
    }
}

impl Drop for PendingResult {
    fn drop(&mut self) {
        if let State::Waiting { table, .. } = &self.state {
            table.forget(self.command_id);
        }
    }
}

impl std::fmt::Debug for PendingResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingResult")
            .field("command_id", &self.command_id)
            .field("resolved", &matches!(self.state, State::Ready(_)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, CommandKind};

    fn result_for(id: u64) -> RenderResult {
        let mut cmd = Command::new(CommandKind::Render, 1);
        cmd.id = id;
        RenderResult::success(&cmd)
    }

    #[tokio::test]
    async fn test_complete_resolves_handle() {
        let table = Arc::new(PendingTable::default());
        let pending = table.register(5, Duration::from_secs(5), None);
        assert!(table.contains(5));

        assert!(table.complete(result_for(5)));
        let result = pending.await.unwrap();
        assert_eq!(result.command_id, 5);
        assert_eq!(table.len(), 0);
        assert_eq!(table.completed(), 1);
    }

    #[tokio::test]
    async fn test_timeout_resolves_once_and_late_result_is_dropped() {
        let table = Arc::new(PendingTable::default());
        let pending = table.register(9, Duration::from_millis(20), None);

        assert!(matches!(
            pending.await,
            Err(RenderwireError::Timeout { command_id: 9 })
        ));
        assert_eq!(table.timed_out(), 1);
        assert!(!table.contains(9));

        assert!(!table.complete(result_for(9)));
        assert_eq!(table.unmatched(), 1);
        assert_eq!(table.timed_out(), 1);
    }

    #[tokio::test]
    async fn test_sweep_and_handle_deadline_count_once() {
        let table = Arc::new(PendingTable::default());
        let pending = table.register(3, Duration::from_millis(10), None);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(table.expire(Instant::now()), 1);
        assert!(matches!(
            pending.await,
            Err(RenderwireError::Timeout { command_id: 3 })
        ));
        assert_eq!(table.timed_out(), 1);
    }

    #[tokio::test]
    async fn test_cancel_all_rejects_with_shutdown() {
        let table = Arc::new(PendingTable::default());
        let a = table.register(1, Duration::from_secs(5), None);
        let b = table.register(2, Duration::from_secs(5), None);

        assert_eq!(table.cancel_all(), 2);
        assert!(matches!(a.await, Err(RenderwireError::Shutdown)));
        assert!(matches!(b.await, Err(RenderwireError::Shutdown)));
    }

    #[tokio::test]
    async fn test_fail_delivers_transport_error() {
        let table = Arc::new(PendingTable::default());
        let pending = table.register(4, Duration::from_secs(5), None);
        assert!(table.fail(4, RenderwireError::TransportUnavailable("down".into())));
        assert!(matches!(
            pending.await,
            Err(RenderwireError::TransportUnavailable(_))
        ));
        assert_eq!(table.failed(), 1);
    }

    #[test]
    fn test_dropped_handle_leaves_table() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let table = Arc::new(PendingTable::default());
        let pending = rt.block_on(async { table.register(8, Duration::from_secs(5), None) });
        drop(pending);
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn test_ready_handle() {
        let pending = PendingResult::ready(11, Err(RenderwireError::BackpressureTimeout));
        assert_eq!(pending.command_id(), 11);
        assert!(matches!(
            pending.await,
            Err(RenderwireError::BackpressureTimeout)
        ));
    }
}
