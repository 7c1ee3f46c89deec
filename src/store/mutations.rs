use std::collections::HashSet;

use tokio::sync::oneshot;
use tracing::info;

use crate::limits::*;
use crate::model::*;

use super::{Store, StoreError, WalCommand};

fn validate_case(case: &SurgeryCase) -> Result<(), StoreError> {
    if case.id.is_empty() {
        return Err(StoreError::InvalidInput("case id must not be empty".into()));
    }
    if case.tasks.len() > MAX_TASKS_PER_CASE {
        return Err(StoreError::LimitExceeded("too many tasks in case"));
    }
    if case.patient_name.len() > MAX_NAME_LEN || case.procedure_name.len() > MAX_NAME_LEN {
        return Err(StoreError::LimitExceeded("name too long"));
    }
    let mut seen = HashSet::new();
    for task in &case.tasks {
        if task.case_id != case.id {
            return Err(StoreError::InvalidInput(format!(
                "task {} belongs to {}, not {}",
                task.id, task.case_id, case.id
            )));
        }
        if !seen.insert(task.id.as_str()) {
            return Err(StoreError::InvalidInput(format!("duplicate task id {}", task.id)));
        }
        if task.name.len() > MAX_NAME_LEN {
            return Err(StoreError::LimitExceeded("task name too long"));
        }
        if let Some(w) = task.window {
            if w.start >= w.end {
                return Err(StoreError::InvalidInput(format!(
                    "task {} window must end after it starts",
                    task.id
                )));
            }
            if w.duration_ms() > MAX_WINDOW_MS {
                return Err(StoreError::LimitExceeded("task window too wide"));
            }
        }
    }
    Ok(())
}

impl Store {
    /// Upsert the case and replace its whole task set in one WAL event.
    pub async fn add_or_replace_case(&self, case: SurgeryCase) -> Result<(), StoreError> {
        let _writer = self.writer.lock().await;
        self.add_or_replace_locked(case).await
    }

    pub(super) async fn add_or_replace_locked(&self, case: SurgeryCase) -> Result<(), StoreError> {
        validate_case(&case)?;
        if !self.cases.contains_key(&case.id) && self.cases.len() >= MAX_CASES {
            return Err(StoreError::LimitExceeded("too many cases"));
        }
        self.commit(Event::CaseUpserted { case }).await
    }

    /// Remove a case and its tasks. Absence is not an error.
    pub async fn delete_case(&self, id: &str) -> Result<bool, StoreError> {
        let _writer = self.writer.lock().await;
        if !self.cases.contains_key(id) {
            return Ok(false);
        }
        self.commit(Event::CaseDeleted { id: id.to_string() }).await?;
        info!("case {id} deleted");
        Ok(true)
    }

    pub async fn add_notification(&self, message: &str) -> Result<Notification, StoreError> {
        self.add_notification_at(message, now_ms()).await
    }

    pub async fn add_notification_at(&self, message: &str, at: Ms) -> Result<Notification, StoreError> {
        if message.len() > MAX_NOTIFICATION_LEN {
            return Err(StoreError::LimitExceeded("notification too long"));
        }
        let _writer = self.writer.lock().await;
        let seq = self.take_seq();
        let message = message.to_string();
        self.commit(Event::NotificationAdded {
            seq,
            at,
            message: message.clone(),
        })
        .await?;
        Ok(Notification { seq, at, message })
    }

    /// Rewrite the WAL with one event per live case and notification.
    pub async fn compact_wal(&self) -> Result<(), StoreError> {
        let _writer = self.writer.lock().await;

        let mut cases: Vec<SurgeryCase> = self.cases.iter().map(|e| e.value().clone()).collect();
        cases.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        let mut events: Vec<Event> = cases
            .into_iter()
            .map(|case| Event::CaseUpserted { case })
            .collect();
        events.extend(self.notifications.read().await.iter().map(|n| {
            Event::NotificationAdded {
                seq: n.seq,
                at: n.at,
                message: n.message.clone(),
            }
        }));

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
