use super::*;

use chrono::FixedOffset;
use shared::{domain::NotificationKind, protocol::NotificationPayload};

use crate::test_support::{at, FakeBackend};

fn note(id: &str, server_id: Option<&str>, created_at: &str, read: bool) -> Notification {
    Notification {
        id: NotificationId::from(id),
        server_id: server_id.map(str::to_string),
        kind: NotificationKind::Info,
        title: None,
        message: format!("notification {id}"),
        link: None,
        read,
        created_at: at(created_at),
    }
}

fn bucket_ids(bucket: &[&Notification]) -> Vec<String> {
    bucket.iter().map(|n| n.id.to_string()).collect()
}

fn assert_unread_invariant(feed: &NotificationFeed) {
    let expected = feed.items().iter().filter(|n| !n.read).count();
    assert_eq!(feed.unread_count(), expected);
}

#[test]
fn buckets_follow_local_day_boundaries() {
    let now = at("2024-06-10T12:00:00Z");
    let list = vec![
        note("today", None, "2024-06-10T01:00:00Z", false),
        note("yesterday", None, "2024-06-09T23:00:00Z", false),
        note("week", None, "2024-06-04T00:00:00Z", false),
        note("older", None, "2024-05-01T00:00:00Z", false),
    ];

    let buckets = group_by_age(&list, &now);

    assert_eq!(bucket_ids(&buckets.today), vec!["today"]);
    assert_eq!(bucket_ids(&buckets.yesterday), vec!["yesterday"]);
    assert_eq!(bucket_ids(&buckets.this_week), vec!["week"]);
    assert_eq!(bucket_ids(&buckets.older), vec!["older"]);
}

#[test]
fn bucket_edges_are_inclusive_at_midnight() {
    let now = at("2024-06-10T12:00:00Z");

    assert_eq!(age_bucket(&at("2024-06-10T00:00:00Z"), &now), AgeBucket::Today);
    assert_eq!(
        age_bucket(&at("2024-06-09T23:59:59Z"), &now),
        AgeBucket::Yesterday
    );
    assert_eq!(
        age_bucket(&at("2024-06-09T00:00:00Z"), &now),
        AgeBucket::Yesterday
    );
    assert_eq!(
        age_bucket(&at("2024-06-03T00:00:00Z"), &now),
        AgeBucket::ThisWeek
    );
    assert_eq!(
        age_bucket(&at("2024-06-02T23:59:59Z"), &now),
        AgeBucket::Older
    );
}

#[test]
fn buckets_use_the_zone_of_now() {
    // 22:30 UTC on the 9th is already the 10th in UTC+3.
    let zone = FixedOffset::east_opt(3 * 3600).expect("offset");
    let now = at("2024-06-10T12:00:00Z").with_timezone(&zone);

    assert_eq!(age_bucket(&at("2024-06-09T22:30:00Z"), &now), AgeBucket::Today);
    assert_eq!(
        age_bucket(&at("2024-06-09T20:30:00Z"), &now),
        AgeBucket::Yesterday
    );
}

#[test]
fn grouping_preserves_list_order() {
    let now = at("2024-06-10T12:00:00Z");
    let list = vec![
        note("b", None, "2024-06-10T09:00:00Z", false),
        note("a", None, "2024-06-10T10:00:00Z", true),
    ];

    let buckets = group_by_age(&list, &now);

    assert_eq!(bucket_ids(&buckets.today), vec!["b", "a"]);
    assert!(buckets.older.is_empty());
}

#[test]
fn feed_receive_prepends_and_dedupes_by_server_id() {
    let mut feed = NotificationFeed::default();

    assert!(feed.receive(note("l1", Some("s1"), "2024-06-10T09:00:00Z", false)));
    assert!(feed.receive(note("l2", Some("s2"), "2024-06-10T10:00:00Z", true)));
    assert!(!feed.receive(note("l3", Some("s1"), "2024-06-10T09:00:00Z", false)));

    let ids = feed.items().iter().map(|n| n.id.as_str()).collect::<Vec<_>>();
    assert_eq!(ids, vec!["l2", "l1"]);
    assert_eq!(feed.unread_count(), 1);
    assert_unread_invariant(&feed);
}

#[test]
fn feed_merge_sorts_newest_first() {
    let mut feed = NotificationFeed::default();
    feed.receive(note("pushed", Some("s3"), "2024-06-10T11:00:00Z", false));

    let added = feed.merge(vec![
        note("old", Some("s1"), "2024-06-08T11:00:00Z", true),
        note("dup", Some("s3"), "2024-06-10T11:00:00Z", false),
        note("mid", Some("s2"), "2024-06-09T11:00:00Z", false),
    ]);

    assert_eq!(added, 2);
    let ids = feed.items().iter().map(|n| n.id.as_str()).collect::<Vec<_>>();
    assert_eq!(ids, vec!["pushed", "mid", "old"]);
    assert_unread_invariant(&feed);
}

#[test]
fn feed_mark_read_reports_server_id_once() {
    let mut feed = NotificationFeed::default();
    feed.receive(note("l1", Some("s1"), "2024-06-10T09:00:00Z", false));

    assert_eq!(
        feed.mark_read(&NotificationId::from("l1")),
        Some(Some("s1".to_string()))
    );
    assert_eq!(feed.mark_read(&NotificationId::from("l1")), Some(None));
    assert_eq!(feed.mark_read(&NotificationId::from("missing")), None);
    assert_eq!(feed.unread_count(), 0);
}

#[tokio::test]
async fn pushes_without_server_id_are_kept_and_counted() {
    let aggregator = NotificationAggregator::new(FakeBackend::new());
    let payload: NotificationPayload = serde_json::from_str(
        r#"{"type":"info","message":"Loan approved","createdAt":"2024-06-10T09:00:00Z"}"#,
    )
    .expect("decode");

    assert!(aggregator.receive(payload.clone().into_notification()).await);
    assert!(aggregator.receive(payload.into_notification()).await);

    let snapshot = aggregator.snapshot().await;
    assert_eq!(snapshot.len(), 2);
    assert!(snapshot.iter().all(|n| n.server_id.is_none()));
    assert_ne!(snapshot[0].id, snapshot[1].id);
    assert_eq!(aggregator.unread_count().await, 2);
}

#[tokio::test]
async fn mark_one_is_optimistic_even_when_backend_fails() {
    let backend = FakeBackend::new();
    backend.fail_update_for("s1").await;
    let aggregator = NotificationAggregator::new(backend.clone());
    aggregator
        .receive(note("l1", Some("s1"), "2024-06-10T09:00:00Z", false))
        .await;
    aggregator
        .receive(note("l2", None, "2024-06-10T10:00:00Z", false))
        .await;

    assert!(aggregator.mark_one(&NotificationId::from("l1")).await);
    assert!(aggregator.mark_one(&NotificationId::from("l2")).await);
    assert!(!aggregator.mark_one(&NotificationId::from("nope")).await);

    assert_eq!(aggregator.unread_count().await, 0);
    // Entries without a server id never reach the backend.
    assert_eq!(
        backend.notification_updates().await,
        vec![("s1".to_string(), true)]
    );
}

#[tokio::test]
async fn mark_all_updates_unread_and_clears_list() {
    let backend = FakeBackend::new();
    backend.fail_update_for("s2").await;
    let aggregator = NotificationAggregator::new(backend.clone());
    aggregator
        .merge(vec![
            note("l1", Some("s1"), "2024-06-10T09:00:00Z", false),
            note("l2", Some("s2"), "2024-06-10T08:00:00Z", false),
            note("l3", Some("s3"), "2024-06-10T07:00:00Z", true),
            note("l4", None, "2024-06-10T06:00:00Z", false),
        ])
        .await;

    let summary = aggregator.mark_all().await;

    assert_eq!(
        summary,
        MarkAllSummary {
            cleared: 4,
            updated: 1,
            failed: 1,
        }
    );
    let mut updated = backend
        .notification_updates()
        .await
        .into_iter()
        .map(|(server_id, _)| server_id)
        .collect::<Vec<_>>();
    updated.sort();
    assert_eq!(updated, vec!["s1", "s2"]);
    assert!(aggregator.snapshot().await.is_empty());
    assert_eq!(aggregator.unread_count().await, 0);
}

#[tokio::test]
async fn mark_all_on_empty_feed_is_a_no_op() {
    let backend = FakeBackend::new();
    let aggregator = NotificationAggregator::new(backend.clone());

    assert_eq!(aggregator.mark_all().await, MarkAllSummary::default());
    assert!(backend.notification_updates().await.is_empty());
}
