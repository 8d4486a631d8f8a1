//! Per-transaction timers.
//!
//! Each transaction owns one [`TimerTable`] holding at most one armed timer
//! per [`TimerKind`]. A firing is delivered into the transaction mailbox
//! tagged with the epoch it was armed under; the actor drops firings whose
//! epoch no longer matches, which closes the race between a timer firing
//! and the same timer being cancelled or re-armed.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::fsm::TsxEvent;

/// The RFC 3261 timer names plus the local auto-100 timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimerKind {
    A,
    B,
    D,
    E,
    F,
    G,
    H,
    I,
    J,
    K,
    L,
    M,
    #[serde(rename = "100")]
    T100,
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerKind::T100 => f.write_str("100"),
            other => write!(f, "{:?}", other),
        }
    }
}

/// The serializable view of one armed timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerSnapshot {
    pub kind: TimerKind,
    pub remaining_ms: u64,
    pub deadline_unix_ns: u64,
}

struct Entry {
    epoch: u64,
    deadline: Instant,
    wall_deadline: SystemTime,
    task: JoinHandle<()>,
}

/// The set of single-shot timers owned by one transaction.
pub(crate) struct TimerTable {
    events: UnboundedSender<TsxEvent>,
    entries: Mutex<HashMap<TimerKind, Entry>>,
    epochs: AtomicU64,
}

impl TimerTable {
    pub(crate) fn new(events: UnboundedSender<TsxEvent>) -> Self {
        TimerTable {
            events,
            entries: Mutex::new(HashMap::new()),
            epochs: AtomicU64::new(0),
        }
    }

    /// Arms `kind` to fire after `duration`, replacing any previous arming.
    /// Re-arming with a new duration is how the exponential backoff timers
    /// reschedule themselves.
    pub(crate) fn start(&self, kind: TimerKind, duration: Duration) {
        let epoch = self.epochs.fetch_add(1, Ordering::Relaxed) + 1;
        let deadline = Instant::now() + duration;
        let wall_deadline = SystemTime::now() + duration;

        let events = self.events.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = events.send(TsxEvent::Timer { kind, epoch });
        });

        let old = self.entries.lock().expect("Lock failed").insert(
            kind,
            Entry {
                epoch,
                deadline,
                wall_deadline,
                task,
            },
        );
        if let Some(old) = old {
            old.task.abort();
        }
    }

    /// Disarms `kind`. A firing already in flight is dropped by its epoch.
    pub(crate) fn cancel(&self, kind: TimerKind) {
        if let Some(entry) = self.entries.lock().expect("Lock failed").remove(&kind) {
            entry.task.abort();
        }
    }

    pub(crate) fn cancel_all(&self) {
        let mut entries = self.entries.lock().expect("Lock failed");
        for (_, entry) in entries.drain() {
            entry.task.abort();
        }
    }

    /// Consumes the arming of `kind` if `epoch` is still current. Returns
    /// `false` for a stale firing, which the caller must ignore.
    pub(crate) fn take_fired(&self, kind: TimerKind, epoch: u64) -> bool {
        let mut entries = self.entries.lock().expect("Lock failed");
        match entries.get(&kind) {
            Some(entry) if entry.epoch == epoch => {
                entries.remove(&kind);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn is_armed(&self, kind: TimerKind) -> bool {
        self.entries.lock().expect("Lock failed").contains_key(&kind)
    }

    /// A serializable view of every armed timer.
    pub(crate) fn snapshot(&self) -> Vec<TimerSnapshot> {
        let now = Instant::now();
        let entries = self.entries.lock().expect("Lock failed");
        let mut timers: Vec<_> = entries
            .iter()
            .map(|(kind, entry)| TimerSnapshot {
                kind: *kind,
                remaining_ms: entry.deadline.saturating_duration_since(now).as_millis() as u64,
                deadline_unix_ns: entry
                    .wall_deadline
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_nanos() as u64)
                    .unwrap_or(0),
            })
            .collect();
        timers.sort_by_key(|t| t.remaining_ms);
        timers
    }

    /// Re-arms `kind` to its recorded wall-clock deadline. A deadline in
    /// the past arms a zero-duration timer, firing right after restore.
    pub(crate) fn restore(&self, kind: TimerKind, deadline_unix_ns: u64) {
        let deadline = UNIX_EPOCH + Duration::from_nanos(deadline_unix_ns);
        let remaining = deadline
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO);
        self.start(kind, remaining);
    }
}

impl Drop for TimerTable {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;
    use tokio::time::sleep;

    #[tokio::test(start_paused = true)]
    async fn test_fire_and_take() {
        let (tx, mut rx) = unbounded_channel();
        let timers = TimerTable::new(tx);

        timers.start(TimerKind::A, Duration::from_millis(500));
        assert!(timers.is_armed(TimerKind::A));

        sleep(Duration::from_millis(501)).await;
        let TsxEvent::Timer { kind, epoch } = rx.recv().await.unwrap() else {
            panic!("expected a timer event");
        };
        assert_eq!(kind, TimerKind::A);
        assert!(timers.take_fired(kind, epoch));
        assert!(!timers.is_armed(TimerKind::A));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_epoch_dropped() {
        let (tx, mut rx) = unbounded_channel();
        let timers = TimerTable::new(tx);

        timers.start(TimerKind::G, Duration::from_millis(100));
        sleep(Duration::from_millis(101)).await;
        let TsxEvent::Timer { epoch: stale, .. } = rx.recv().await.unwrap() else {
            panic!("expected a timer event");
        };

        // Re-armed before the stale firing was processed.
        timers.start(TimerKind::G, Duration::from_millis(200));
        assert!(!timers.take_fired(TimerKind::G, stale));
        assert!(timers.is_armed(TimerKind::G));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_silences_timer() {
        let (tx, mut rx) = unbounded_channel();
        let timers = TimerTable::new(tx);

        timers.start(TimerKind::B, Duration::from_millis(50));
        timers.cancel(TimerKind::B);

        sleep(Duration::from_millis(60)).await;
        match rx.try_recv() {
            Err(_) => {}
            Ok(TsxEvent::Timer { kind, epoch }) => {
                // The task may have fired before the abort landed; the epoch
                // check still rejects it.
                assert!(!timers.take_fired(kind, epoch));
            }
            Ok(_) => panic!("unexpected event"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_remaining() {
        let (tx, _rx) = unbounded_channel();
        let timers = TimerTable::new(tx);

        timers.start(TimerKind::B, Duration::from_secs(32));
        sleep(Duration::from_secs(2)).await;

        let snapshot = timers.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].kind, TimerKind::B);
        assert_eq!(snapshot[0].remaining_ms, 30_000);
        assert!(snapshot[0].deadline_unix_ns > 0);
    }
}
