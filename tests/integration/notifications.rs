use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use parlor::gateway::{EventKind, Procedure, Table};
use parlor::kv::{KeyValueStore, MemoryStore};
use parlor::model::ConversationId;
use parlor::notify::UnreadTracker;
use parlor::subs::SubscriptionManager;

use crate::support::{
    conversation_row, dm_message_row, fast_config, settle, ts, MockGateway,
};

fn tracker_for(
    gateway: &Arc<MockGateway>,
    kv: Arc<dyn KeyValueStore>,
    user: &str,
) -> Arc<UnreadTracker<MockGateway>> {
    let subs = SubscriptionManager::new(gateway.clone());
    UnreadTracker::new(gateway.clone(), subs, kv, user.into(), &fast_config())
}

#[tokio::test]
async fn conversations_past_the_cursor_start_unread() {
    let gateway = MockGateway::new();
    gateway.seed(
        Table::Conversations,
        vec![
            conversation_row("conv-1", ("me", "me"), ("u2", "bob"), 100, Vec::new()),
            conversation_row("conv-2", ("me", "me"), ("u3", "cara"), 200, Vec::new()),
            conversation_row("conv-other", ("u8", "x"), ("u9", "y"), 300, Vec::new()),
        ],
    );

    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let tracker = tracker_for(&gateway, kv, "me");
    tracker.start().await.unwrap();

    // No cursor stored yet: everything involving us is unread.
    assert!(tracker.has_unread());
    assert_eq!(
        tracker.unread_conversations(),
        vec![ConversationId::new("conv-1"), ConversationId::new("conv-2")]
    );
    tracker.stop();
}

#[tokio::test]
async fn read_cursor_round_trips_across_restarts() {
    let gateway = MockGateway::new();
    gateway.seed(
        Table::Conversations,
        vec![conversation_row("conv-1", ("me", "me"), ("u2", "bob"), 100, Vec::new())],
    );
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let conversation = ConversationId::new("conv-1");

    let tracker = tracker_for(&gateway, kv.clone(), "me");
    tracker.start().await.unwrap();
    assert!(tracker.is_unread(&conversation));

    tracker.mark_as_read(&conversation, ts(100)).unwrap();
    assert!(!tracker.is_unread(&conversation));
    settle().await;
    assert_eq!(gateway.calls_of(Procedure::UpdateReadCursor), 1);
    tracker.stop();

    // Reopening with the same device storage: still read.
    let reopened = tracker_for(&gateway, kv.clone(), "me");
    reopened.start().await.unwrap();
    assert!(!reopened.is_unread(&conversation));
    reopened.stop();

    // A newer message moves updated_at past the cursor again.
    let gateway2 = MockGateway::new();
    gateway2.seed(
        Table::Conversations,
        vec![conversation_row("conv-1", ("me", "me"), ("u2", "bob"), 200, Vec::new())],
    );
    let later = tracker_for(&gateway2, kv, "me");
    later.start().await.unwrap();
    assert!(later.is_unread(&conversation));
    later.stop();
}

#[tokio::test]
async fn incoming_dm_marks_unread_and_shows_a_preview() {
    let gateway = MockGateway::new();
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let tracker = tracker_for(&gateway, kv, "me");
    tracker.start().await.unwrap();

    let tail = vec![dm_message_row("d1", "conv-1", "u2", 150, "hey you")];
    gateway.emit(
        Table::Conversations,
        EventKind::Update,
        conversation_row("conv-1", ("me", "me"), ("u2", "bob"), 150, tail),
    );
    settle().await;

    assert!(tracker.is_unread(&ConversationId::new("conv-1")));
    let preview = tracker.preview().expect("preview should be visible");
    assert_eq!(preview.conversation_id, ConversationId::new("conv-1"));
    assert_eq!(preview.sender_name, "bob");
    assert_eq!(preview.content, "hey you");
    tracker.stop();
}

#[tokio::test]
async fn own_messages_never_notify() {
    let gateway = MockGateway::new();
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let tracker = tracker_for(&gateway, kv, "me");
    tracker.start().await.unwrap();

    let tail = vec![dm_message_row("d1", "conv-1", "me", 150, "my own words")];
    gateway.emit(
        Table::Conversations,
        EventKind::Update,
        conversation_row("conv-1", ("me", "me"), ("u2", "bob"), 150, tail),
    );
    settle().await;

    assert!(!tracker.has_unread());
    assert_eq!(tracker.preview(), None);
    tracker.stop();
}

#[tokio::test]
async fn previews_expire_after_the_display_window() {
    let gateway = MockGateway::new();
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    // fast_config: 80ms display + 20ms grace.
    let tracker = tracker_for(&gateway, kv, "me");
    tracker.start().await.unwrap();

    let tail = vec![dm_message_row("d1", "conv-1", "u2", 150, "hey")];
    gateway.emit(
        Table::Conversations,
        EventKind::Update,
        conversation_row("conv-1", ("me", "me"), ("u2", "bob"), 150, tail),
    );
    settle().await;
    assert!(tracker.preview().is_some());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(tracker.preview(), None);
    tracker.stop();
}

#[tokio::test]
async fn a_newer_preview_supersedes_the_pending_clear() {
    let gateway = MockGateway::new();
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let tracker = tracker_for(&gateway, kv, "me");
    tracker.start().await.unwrap();

    let first_tail = vec![dm_message_row("d1", "conv-1", "u2", 150, "first")];
    gateway.emit(
        Table::Conversations,
        EventKind::Update,
        conversation_row("conv-1", ("me", "me"), ("u2", "bob"), 150, first_tail),
    );
    tokio::time::sleep(Duration::from_millis(60)).await;

    let second_tail = vec![dm_message_row("d2", "conv-2", "u3", 160, "second")];
    gateway.emit(
        Table::Conversations,
        EventKind::Update,
        conversation_row("conv-2", ("me", "me"), ("u3", "cara"), 160, second_tail),
    );
    tokio::time::sleep(Duration::from_millis(60)).await;

    // Past the first preview's window, but the second is still on screen.
    let preview = tracker.preview().expect("second preview still visible");
    assert_eq!(preview.content, "second");

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(tracker.preview(), None);
    tracker.stop();
}

#[tokio::test]
async fn remote_cursor_sync_failure_keeps_the_local_mark() {
    let gateway = MockGateway::new();
    gateway.seed(
        Table::Conversations,
        vec![conversation_row("conv-1", ("me", "me"), ("u2", "bob"), 100, Vec::new())],
    );
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let tracker = tracker_for(&gateway, kv, "me");
    tracker.start().await.unwrap();

    gateway.fail_calls(Procedure::UpdateReadCursor, 1);
    tracker.mark_as_read(&ConversationId::new("conv-1"), ts(100)).unwrap();
    settle().await;

    // Local-first: the failed remote sync does not roll the mark back.
    assert!(!tracker.is_unread(&ConversationId::new("conv-1")));
    tracker.stop();
}
