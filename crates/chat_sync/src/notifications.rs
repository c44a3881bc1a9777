use std::{collections::HashSet, sync::Arc};

use chrono::{DateTime, Days, NaiveDate, NaiveTime, TimeZone, Utc};
use futures::future::join_all;
use serde::Serialize;
use shared::domain::{Notification, NotificationId};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::api::SyncBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AgeBucket {
    Today,
    Yesterday,
    ThisWeek,
    Older,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct NotificationBuckets<'a> {
    pub today: Vec<&'a Notification>,
    pub yesterday: Vec<&'a Notification>,
    pub this_week: Vec<&'a Notification>,
    pub older: Vec<&'a Notification>,
}

struct DayBoundaries {
    today: DateTime<Utc>,
    yesterday: DateTime<Utc>,
    week: DateTime<Utc>,
}

impl DayBoundaries {
    fn new<Tz: TimeZone>(now: &DateTime<Tz>) -> Self {
        let tz = now.timezone();
        let today = now.date_naive();
        let yesterday = today.checked_sub_days(Days::new(1)).unwrap_or(today);
        let week = today.checked_sub_days(Days::new(7)).unwrap_or(today);
        Self {
            today: local_midnight(&tz, today),
            yesterday: local_midnight(&tz, yesterday),
            week: local_midnight(&tz, week),
        }
    }

    fn classify(&self, created_at: &DateTime<Utc>) -> AgeBucket {
        if *created_at >= self.today {
            AgeBucket::Today
        } else if *created_at >= self.yesterday {
            AgeBucket::Yesterday
        } else if *created_at >= self.week {
            AgeBucket::ThisWeek
        } else {
            AgeBucket::Older
        }
    }
}

fn local_midnight<Tz: TimeZone>(tz: &Tz, date: NaiveDate) -> DateTime<Utc> {
    let midnight = date.and_time(NaiveTime::MIN);
    // A DST gap can swallow midnight; the first instant of that day is then an hour later.
    tz.from_local_datetime(&midnight)
        .earliest()
        .or_else(|| {
            tz.from_local_datetime(&(midnight + chrono::Duration::hours(1)))
                .earliest()
        })
        .map(|start| start.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&midnight))
}

pub fn age_bucket<Tz: TimeZone>(created_at: &DateTime<Utc>, now: &DateTime<Tz>) -> AgeBucket {
    DayBoundaries::new(now).classify(created_at)
}

/// Splits notifications into local-day age buckets relative to `now`, preserving list order.
pub fn group_by_age<'a, Tz: TimeZone>(
    notifications: &'a [Notification],
    now: &DateTime<Tz>,
) -> NotificationBuckets<'a> {
    let boundaries = DayBoundaries::new(now);
    let mut buckets = NotificationBuckets::default();
    for notification in notifications {
        let bucket = match boundaries.classify(&notification.created_at) {
            AgeBucket::Today => &mut buckets.today,
            AgeBucket::Yesterday => &mut buckets.yesterday,
            AgeBucket::ThisWeek => &mut buckets.this_week,
            AgeBucket::Older => &mut buckets.older,
        };
        bucket.push(notification);
    }
    buckets
}

/// In-memory feed, newest first. The unread counter is recomputed after every mutation.
#[derive(Debug, Default, Clone)]
pub struct NotificationFeed {
    items: Vec<Notification>,
    unread_count: usize,
}

impl NotificationFeed {
    pub fn items(&self) -> &[Notification] {
        &self.items
    }

    pub fn unread_count(&self) -> usize {
        self.unread_count
    }

    /// Prepends unless the notification (by server id or local id) is already present.
    pub fn receive(&mut self, notification: Notification) -> bool {
        if self.contains(&notification) {
            return false;
        }
        self.items.insert(0, notification);
        self.recount();
        true
    }

    /// Merges a fetched page, keeping the list newest first. Returns how many were new.
    pub fn merge(&mut self, notifications: Vec<Notification>) -> usize {
        let mut added = 0;
        for notification in notifications {
            if !self.contains(&notification) {
                self.items.push(notification);
                added += 1;
            }
        }
        self.items
            .sort_by(|left, right| right.created_at.cmp(&left.created_at));
        self.recount();
        added
    }

    /// Marks one entry read. Returns its server id (if any), or `None` when the id is unknown.
    pub fn mark_read(&mut self, id: &NotificationId) -> Option<Option<String>> {
        let notification = self.items.iter_mut().find(|n| &n.id == id)?;
        let server_id = if notification.read {
            None
        } else {
            notification.read = true;
            notification.server_id.clone()
        };
        self.recount();
        Some(server_id)
    }

    pub fn remove_all(&mut self, ids: &HashSet<NotificationId>) {
        self.items.retain(|notification| !ids.contains(&notification.id));
        self.recount();
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.recount();
    }

    fn contains(&self, candidate: &Notification) -> bool {
        self.items.iter().any(|existing| {
            existing.id == candidate.id
                || (existing.server_id.is_some() && existing.server_id == candidate.server_id)
        })
    }

    fn recount(&mut self) {
        self.unread_count = self.items.iter().filter(|n| !n.read).count();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkAllSummary {
    pub cleared: usize,
    pub updated: usize,
    pub failed: usize,
}

pub struct NotificationAggregator {
    backend: Arc<dyn SyncBackend>,
    feed: Mutex<NotificationFeed>,
}

impl NotificationAggregator {
    pub fn new(backend: Arc<dyn SyncBackend>) -> Self {
        Self {
            backend,
            feed: Mutex::new(NotificationFeed::default()),
        }
    }

    pub async fn receive(&self, notification: Notification) -> bool {
        self.feed.lock().await.receive(notification)
    }

    pub async fn merge(&self, notifications: Vec<Notification>) -> usize {
        self.feed.lock().await.merge(notifications)
    }

    pub async fn snapshot(&self) -> Vec<Notification> {
        self.feed.lock().await.items().to_vec()
    }

    pub async fn unread_count(&self) -> usize {
        self.feed.lock().await.unread_count()
    }

    /// Optimistic: the local flag stays set even if the backend update fails.
    pub async fn mark_one(&self, id: &NotificationId) -> bool {
        let server_id = {
            let mut feed = self.feed.lock().await;
            match feed.mark_read(id) {
                Some(server_id) => server_id,
                None => return false,
            }
        };

        if let Some(server_id) = server_id {
            if let Err(err) = self.backend.update_notification(&server_id, true).await {
                warn!(notification_id = %id, server_id = %server_id, "notifications: mark read failed: {err}");
            }
        }
        true
    }

    /// Updates every unread entry concurrently, then drops the entries that were in the feed
    /// when the call started. Backend failures do not keep entries around.
    pub async fn mark_all(&self) -> MarkAllSummary {
        let (present, server_ids) = {
            let feed = self.feed.lock().await;
            let present = feed
                .items()
                .iter()
                .map(|n| n.id.clone())
                .collect::<HashSet<_>>();
            let server_ids = feed
                .items()
                .iter()
                .filter(|n| !n.read)
                .filter_map(|n| n.server_id.clone())
                .collect::<Vec<_>>();
            (present, server_ids)
        };

        let backend = &self.backend;
        let results = join_all(server_ids.iter().map(|server_id| async move {
            (
                server_id,
                backend.update_notification(server_id, true).await,
            )
        }))
        .await;

        let mut summary = MarkAllSummary::default();
        for (server_id, result) in results {
            match result {
                Ok(()) => summary.updated += 1,
                Err(err) => {
                    summary.failed += 1;
                    warn!(server_id = %server_id, "notifications: mark all update failed: {err}");
                }
            }
        }

        let mut feed = self.feed.lock().await;
        feed.remove_all(&present);
        summary.cleared = present.len();
        info!(
            cleared = summary.cleared,
            updated = summary.updated,
            failed = summary.failed,
            "notifications: marked all read"
        );
        summary
    }

    pub async fn clear(&self) {
        self.feed.lock().await.clear();
    }
}

#[cfg(test)]
#[path = "tests/notifications_tests.rs"]
mod tests;
