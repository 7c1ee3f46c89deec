mod allocator;
mod error;
mod mutations;
mod queries;
pub mod refresh;

pub use allocator::{ScheduleOutcome, Unschedulable};
pub use error::StoreError;

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::info;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued behind it.
/// 3. One flush_sync for the whole batch, then answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after an append error so half-written bytes don't leak into the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Store ────────────────────────────────────────────────

/// Durable record of cases, tasks and notifications, rebuilt from the WAL on open.
///
/// Every mutating path (upsert, delete, schedule, read-time refresh, notification
/// append) runs under `writer`, so a room lookup followed by an assignment is one
/// critical section.
pub struct Store {
    pub(super) cases: DashMap<String, SurgeryCase>,
    /// Room reservation index in declaration (allocation) order.
    pub(super) rooms: RwLock<Vec<RoomState>>,
    pub(super) notifications: RwLock<Vec<Notification>>,
    pub(super) next_seq: AtomicU64,
    pub(super) writer: Mutex<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

/// Rebuild the reservations of one case: drop the old ones, add one per timed task
/// that names a known room.
fn index_case(rooms: &mut [RoomState], case_id: &str, case: Option<&SurgeryCase>) {
    for rs in rooms.iter_mut() {
        rs.remove_case(case_id);
    }
    let Some(case) = case else { return };
    for task in &case.tasks {
        let (Some(room_id), Some(span)) = (&task.room_id, task.window) else {
            continue;
        };
        if let Some(rs) = rooms.iter_mut().find(|rs| &rs.room.id == room_id) {
            rs.insert_reservation(Reservation {
                task_id: task.id.clone(),
                case_id: case.id.clone(),
                span,
            });
        }
    }
}

/// Apply an event to in-memory state (no locking — caller holds the guards).
fn apply_event(
    cases: &DashMap<String, SurgeryCase>,
    rooms: &mut [RoomState],
    notifications: &mut Vec<Notification>,
    event: &Event,
) {
    match event {
        Event::CaseUpserted { case } => {
            index_case(rooms, &case.id, Some(case));
            cases.insert(case.id.clone(), case.clone());
        }
        Event::CaseDeleted { id } => {
            index_case(rooms, id, None);
            cases.remove(id);
        }
        Event::NotificationAdded { seq, at, message } => notifications.push(Notification {
            seq: *seq,
            at: *at,
            message: message.clone(),
        }),
    }
}

impl Store {
    pub fn new(wal_path: PathBuf, rooms: Vec<OrRoom>, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let cases = DashMap::new();
        let mut room_states: Vec<RoomState> = rooms.into_iter().map(RoomState::new).collect();
        let mut notifications = Vec::new();
        for event in &events {
            apply_event(&cases, &mut room_states, &mut notifications, event);
        }
        let next_seq = notifications.iter().map(|n| n.seq + 1).max().unwrap_or(1);

        info!(
            "store opened at {}: {} events, {} cases, {} rooms",
            wal_path.display(),
            events.len(),
            cases.len(),
            room_states.len()
        );

        Ok(Self {
            cases,
            rooms: RwLock::new(room_states),
            notifications: RwLock::new(notifications),
            next_seq: AtomicU64::new(next_seq),
            writer: Mutex::new(()),
            wal_tx,
            notify,
        })
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }

    /// WAL-append + apply + publish. Caller holds `writer`.
    pub(super) async fn commit(&self, event: Event) -> Result<(), StoreError> {
        self.wal_append(&event).await?;
        {
            let mut rooms = self.rooms.write().await;
            let mut notifications = self.notifications.write().await;
            apply_event(&self.cases, &mut rooms, &mut notifications, &event);
        }
        self.notify.publish(&event);
        Ok(())
    }

    pub(super) fn take_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    pub fn case_count(&self) -> usize {
        self.cases.len()
    }

    pub fn has_case(&self, id: &str) -> bool {
        self.cases.contains_key(id)
    }
}
