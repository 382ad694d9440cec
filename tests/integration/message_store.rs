use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;

use parlor::config::PAGE_SIZE;
use parlor::error::{ChannelError, Error};
use parlor::gateway::{EventKind, Table};
use parlor::kv::{DraftStore, KeyValueStore, MemoryStore};
use parlor::model::{Channel, MessageId, UserId};
use parlor::store::{MessageStore, Phase};
use parlor::subs::SubscriptionManager;

use crate::support::{author, dm_message_row, fast_config, message_row, settle, ts, MockGateway};

fn group_store(
    gateway: &Arc<MockGateway>,
) -> (Arc<SubscriptionManager<MockGateway>>, Arc<MessageStore<MockGateway>>) {
    let subs = SubscriptionManager::new(gateway.clone());
    let store = MessageStore::new(gateway.clone(), subs.clone(), Channel::Group, &fast_config());
    (subs, store)
}

#[tokio::test]
async fn initial_load_is_idempotent() {
    let gateway = MockGateway::new();
    gateway.seed(
        Table::Messages,
        (1..=5).map(|i| message_row(&format!("m{i}"), i, "u1", "hi")).collect(),
    );
    let (_subs, store) = group_store(&gateway);

    store.open().await.unwrap();
    let first = store.messages();
    store.load_latest().await.unwrap();
    let second = store.messages();

    assert_eq!(first, second);
    assert_eq!(first.len(), 5);
    assert_eq!(store.phase(), Phase::Ready);
}

#[tokio::test]
async fn sequence_stays_sorted_oldest_first() {
    let gateway = MockGateway::new();
    gateway.seed(
        Table::Messages,
        vec![
            message_row("m3", 30, "u1", "third"),
            message_row("m1", 10, "u1", "first"),
            message_row("m2", 20, "u1", "second"),
        ],
    );
    let (_subs, store) = group_store(&gateway);
    store.open().await.unwrap();

    let messages = store.messages();
    let ids: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, ["m1", "m2", "m3"]);
    for pair in messages.windows(2) {
        assert!(pair[0].created_at <= pair[1].created_at);
    }
}

#[tokio::test]
async fn realtime_insert_dedups_by_id() {
    let gateway = MockGateway::new();
    gateway.seed(Table::Messages, vec![message_row("m1", 10, "u1", "hi")]);
    let (_subs, store) = group_store(&gateway);
    store.open().await.unwrap();

    gateway.emit(Table::Messages, EventKind::Insert, message_row("m1", 10, "u1", "hi"));
    gateway.emit(Table::Messages, EventKind::Insert, message_row("m2", 20, "u2", "hello"));
    gateway.emit(Table::Messages, EventKind::Insert, message_row("m2", 20, "u2", "hello"));
    settle().await;

    assert_eq!(store.messages().len(), 2);
}

#[tokio::test]
async fn late_arriving_insert_keeps_order() {
    let gateway = MockGateway::new();
    gateway.seed(Table::Messages, vec![message_row("m5", 50, "u1", "latest")]);
    let (_subs, store) = group_store(&gateway);
    store.open().await.unwrap();

    // Delivered after a newer message was already loaded.
    gateway.emit(Table::Messages, EventKind::Insert, message_row("m4", 40, "u2", "older"));
    settle().await;

    let ids: Vec<String> =
        store.messages().iter().map(|m| m.id.as_str().to_owned()).collect();
    assert_eq!(ids, ["m4", "m5"]);
}

#[tokio::test]
async fn backfill_pages_until_history_is_exhausted() {
    let gateway = MockGateway::new();
    gateway.seed(
        Table::Messages,
        (1..=45).map(|i| message_row(&format!("m{i:02}"), i, "u1", "hi")).collect(),
    );
    let (_subs, store) = group_store(&gateway);

    store.open().await.unwrap();
    assert_eq!(store.messages().len(), PAGE_SIZE);
    assert!(store.has_more());
    let first_cursor = store.cursor().unwrap();
    assert_eq!(first_cursor, ts(26));

    store.load_older().await.unwrap();
    assert_eq!(store.messages().len(), 2 * PAGE_SIZE);
    let second_cursor = store.cursor().unwrap();
    assert!(second_cursor <= first_cursor);
    assert!(store.has_more());

    store.load_older().await.unwrap();
    assert_eq!(store.messages().len(), 45);
    assert!(!store.has_more());

    // Exhausted history issues no further backend calls.
    let queries = gateway.query_count.load(Ordering::SeqCst);
    store.load_older().await.unwrap();
    assert_eq!(gateway.query_count.load(Ordering::SeqCst), queries);

    let messages = store.messages();
    for pair in messages.windows(2) {
        assert!(
            (pair[0].created_at, pair[0].id.as_str())
                < (pair[1].created_at, pair[1].id.as_str())
        );
    }
}

#[tokio::test]
async fn backfill_without_cursor_is_a_no_op() {
    let gateway = MockGateway::new();
    let (_subs, store) = group_store(&gateway);
    store.open().await.unwrap();
    assert_eq!(store.cursor(), None);
    assert!(!store.has_more());

    let queries = gateway.query_count.load(Ordering::SeqCst);
    store.load_older().await.unwrap();
    assert_eq!(gateway.query_count.load(Ordering::SeqCst), queries);
}

#[tokio::test]
async fn send_appends_exactly_once_via_echo() {
    let gateway = MockGateway::new();
    let (_subs, store) = group_store(&gateway);
    store.open().await.unwrap();

    store.send("hello there", &author("u1", "Alice")).await.unwrap();
    settle().await;

    let messages = store.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "hello there");
    assert_eq!(messages[0].author_id, UserId::new("u1"));
    // Fetch/send fire the best-effort heartbeat.
    assert!(gateway.calls_of(parlor::gateway::Procedure::Heartbeat) >= 1);
}

#[tokio::test]
async fn failed_send_preserves_the_draft() {
    let gateway = MockGateway::new();
    let (_subs, store) = group_store(&gateway);
    store.open().await.unwrap();

    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let drafts = DraftStore::new(kv);
    drafts.save(&Channel::Group, "hello").unwrap();

    gateway.fail_inserts(3);
    let result = store.send("hello", &author("u1", "Alice")).await;

    match result {
        Err(Error::Channel(ChannelError::SendFailed { attempts, .. })) => {
            assert_eq!(attempts, 3)
        },
        other => panic!("expected SendFailed, got {other:?}"),
    }
    assert_eq!(gateway.insert_count.load(Ordering::SeqCst), 3);
    // Escalating recovery: feed reopened, then session refreshed.
    assert!(gateway.subscribe_count.load(Ordering::SeqCst) >= 2);
    assert_eq!(gateway.refresh_count.load(Ordering::SeqCst), 1);

    // The caller only clears the draft on success.
    assert_eq!(drafts.load(&Channel::Group).unwrap().as_deref(), Some("hello"));
    assert!(store.messages().is_empty());
}

#[tokio::test]
async fn send_recovers_on_a_retry_attempt() {
    let gateway = MockGateway::new();
    let (_subs, store) = group_store(&gateway);
    store.open().await.unwrap();

    gateway.fail_inserts(2);
    store.send("eventually", &author("u1", "Alice")).await.unwrap();
    settle().await;

    assert_eq!(gateway.insert_count.load(Ordering::SeqCst), 3);
    assert_eq!(store.messages().len(), 1);
}

#[tokio::test]
async fn empty_message_is_rejected_without_retry() {
    let gateway = MockGateway::new();
    let (_subs, store) = group_store(&gateway);
    store.open().await.unwrap();

    let result = store.send("   \n", &author("u1", "Alice")).await;
    assert!(matches!(result, Err(Error::Channel(ChannelError::EmptyMessage))));
    assert_eq!(gateway.insert_count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn reaction_toggle_round_trips_through_update_events() {
    let gateway = MockGateway::new();
    gateway.seed(Table::Messages, vec![message_row("m1", 10, "u1", "hi")]);
    let (_subs, store) = group_store(&gateway);
    store.open().await.unwrap();

    let message = MessageId::new("m1");
    let user = UserId::new("u2");

    store.toggle_reaction(&message, "\u{1F44D}", &user).await.unwrap();
    settle().await;
    let loaded = &store.messages()[0];
    assert_eq!(loaded.reaction_count("\u{1F44D}"), 1);
    assert!(loaded.has_reacted("\u{1F44D}", &user));

    store.toggle_reaction(&message, "\u{1F44D}", &user).await.unwrap();
    settle().await;
    assert_eq!(store.messages()[0].reaction_count("\u{1F44D}"), 0);
}

#[tokio::test]
async fn update_for_unloaded_message_is_dropped() {
    let gateway = MockGateway::new();
    gateway.seed(Table::Messages, vec![message_row("m1", 10, "u1", "hi")]);
    let (_subs, store) = group_store(&gateway);
    store.open().await.unwrap();

    let mut outside = message_row("unloaded", 5, "u1", "old");
    outside.insert("reactions".to_owned(), json!({"\u{1F44D}": ["u2"]}));
    gateway.emit(Table::Messages, EventKind::Update, outside);
    settle().await;

    let messages = store.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, MessageId::new("m1"));
}

#[tokio::test]
async fn initial_load_failure_surfaces_and_retries_on_demand() {
    let gateway = MockGateway::new();
    gateway.seed(Table::Messages, vec![message_row("m1", 10, "u1", "hi")]);
    let (_subs, store) = group_store(&gateway);

    gateway.fail_queries(1);
    assert!(store.open().await.is_err());
    assert_eq!(store.phase(), Phase::Failed);
    assert!(store.last_error().is_some());

    // The caller's retry affordance is another load.
    store.load_latest().await.unwrap();
    assert_eq!(store.phase(), Phase::Ready);
    assert_eq!(store.messages().len(), 1);
}

#[tokio::test]
async fn stale_load_after_close_is_discarded() {
    let gateway = MockGateway::new();
    gateway.seed(Table::Messages, vec![message_row("m1", 10, "u1", "hi")]);
    let (_subs, store) = group_store(&gateway);

    gateway.delay_queries(Duration::from_millis(100));
    let in_flight = {
        let store = store.clone();
        tokio::spawn(async move { store.load_latest().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    store.close();

    let mut revision = store.watch_revision();
    let after_close = *revision.borrow_and_update();
    in_flight.await.unwrap().unwrap();

    assert!(store.messages().is_empty());
    assert_eq!(store.phase(), Phase::Idle);
    assert_eq!(*revision.borrow(), after_close);
}

#[tokio::test]
async fn stores_share_one_feed_per_table() {
    let gateway = MockGateway::new();
    let subs = SubscriptionManager::new(gateway.clone());
    let config = fast_config();
    let first = MessageStore::new(gateway.clone(), subs.clone(), Channel::Group, &config);
    let second = MessageStore::new(gateway.clone(), subs.clone(), Channel::Group, &config);

    first.open().await.unwrap();
    second.open().await.unwrap();
    assert_eq!(gateway.subscribe_count.load(Ordering::SeqCst), 1);
    assert_eq!(gateway.active_feeds(Table::Messages), 1);
    assert_eq!(subs.subscriber_count(Table::Messages), 2);

    first.close();
    assert_eq!(gateway.active_feeds(Table::Messages), 1);

    second.close();
    assert_eq!(gateway.active_feeds(Table::Messages), 0);
    assert_eq!(subs.subscriber_count(Table::Messages), 0);
}

#[tokio::test]
async fn closed_store_ignores_further_events() {
    let gateway = MockGateway::new();
    gateway.seed(Table::Messages, vec![message_row("m1", 10, "u1", "hi")]);
    let (_subs, store) = group_store(&gateway);
    store.open().await.unwrap();
    store.close();

    gateway.emit(Table::Messages, EventKind::Insert, message_row("m2", 20, "u2", "late"));
    settle().await;

    assert!(store.messages().is_empty());
}

#[tokio::test]
async fn dm_channel_only_sees_its_own_conversation() {
    let gateway = MockGateway::new();
    let subs = SubscriptionManager::new(gateway.clone());
    let store = MessageStore::new(
        gateway.clone(),
        subs,
        Channel::Direct("conv-1".into()),
        &fast_config(),
    );
    store.open().await.unwrap();

    gateway.emit(
        Table::DmMessages,
        EventKind::Insert,
        dm_message_row("d1", "conv-1", "u2", 10, "for us"),
    );
    gateway.emit(
        Table::DmMessages,
        EventKind::Insert,
        dm_message_row("d2", "conv-2", "u3", 11, "someone else"),
    );
    settle().await;

    let messages = store.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "for us");
}

#[tokio::test]
async fn dm_send_goes_through_the_append_procedure() {
    let gateway = MockGateway::new();
    let subs = SubscriptionManager::new(gateway.clone());
    let store = MessageStore::new(
        gateway.clone(),
        subs,
        Channel::Direct("conv-1".into()),
        &fast_config(),
    );
    store.open().await.unwrap();

    store.send("direct hello", &author("u1", "Alice")).await.unwrap();
    settle().await;

    assert_eq!(gateway.calls_of(parlor::gateway::Procedure::AppendDmMessage), 1);
    assert_eq!(gateway.insert_count.load(Ordering::SeqCst), 0);
    let messages = store.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "direct hello");
}
