use std::collections::BTreeMap;

use crate::limits::*;
use crate::model::*;

use super::{Store, StoreError};

impl Store {
    /// Case with tasks ordered by window start, refreshed against the clock.
    pub async fn get_case(&self, id: &str) -> Result<Option<SurgeryCase>, StoreError> {
        self.get_case_at(id, now_ms()).await
    }

    pub async fn get_case_at(&self, id: &str, now: Ms) -> Result<Option<SurgeryCase>, StoreError> {
        let _writer = self.writer.lock().await;
        let Some(case) = self.cases.get(id).map(|c| c.value().clone()) else {
            return Ok(None);
        };
        let mut case = self.refresh_and_persist_locked(case, now).await?;
        case.sort_tasks();
        Ok(Some(case))
    }

    /// Newest first; ties broken by id.
    pub async fn list_cases(&self) -> Result<Vec<SurgeryCase>, StoreError> {
        self.list_cases_at(now_ms()).await
    }

    pub async fn list_cases_at(&self, now: Ms) -> Result<Vec<SurgeryCase>, StoreError> {
        let _writer = self.writer.lock().await;
        let snapshot: Vec<SurgeryCase> = self.cases.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(snapshot.len());
        for case in snapshot {
            let mut case = self.refresh_and_persist_locked(case, now).await?;
            case.sort_tasks();
            out.push(case);
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    /// First room in declaration order with no reservation overlapping `span`.
    pub async fn find_available_room(&self, span: &Span) -> Option<OrRoom> {
        let rooms = self.rooms.read().await;
        rooms
            .iter()
            .find(|rs| rs.is_free(span))
            .map(|rs| rs.room.clone())
    }

    pub async fn list_rooms(&self) -> Vec<OrRoom> {
        self.rooms.read().await.iter().map(|rs| rs.room.clone()).collect()
    }

    /// Most recent first, at most `limit` (clamped to `MAX_NOTIFICATION_LIMIT`).
    pub async fn list_notifications(&self, limit: usize) -> Vec<Notification> {
        let limit = limit.min(MAX_NOTIFICATION_LIMIT);
        let notifications = self.notifications.read().await;
        let mut out: Vec<Notification> = notifications.iter().rev().take(limit).cloned().collect();
        out.sort_by(|a, b| b.seq.cmp(&a.seq));
        out
    }

    /// Counts by status after refreshing every case.
    pub async fn snapshot(&self) -> Result<Snapshot, StoreError> {
        self.snapshot_at(now_ms()).await
    }

    pub async fn snapshot_at(&self, now: Ms) -> Result<Snapshot, StoreError> {
        let cases = self.list_cases_at(now).await?;
        let mut cases_by_status = BTreeMap::new();
        for case in &cases {
            *cases_by_status
                .entry(case.status.as_str().to_string())
                .or_insert(0) += 1;
        }
        Ok(Snapshot {
            total_cases: cases.len(),
            total_rooms: self.rooms.read().await.len(),
            cases_by_status,
        })
    }
}
