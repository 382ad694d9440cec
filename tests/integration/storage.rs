use std::sync::Arc;

use pretty_assertions::assert_eq;

use parlor::kv::{DraftStore, ImageCache, KeyValueStore, SledStore};
use parlor::model::Channel;

#[test]
fn sled_store_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let store = SledStore::open(dir.path().join("device.db")).unwrap();

    store.set("draft_message_group", "typing...").unwrap();
    assert_eq!(
        store.get("draft_message_group").unwrap().as_deref(),
        Some("typing...")
    );

    store.remove("draft_message_group").unwrap();
    assert_eq!(store.get("draft_message_group").unwrap(), None);
    assert_eq!(store.get("never-set").unwrap(), None);
}

#[test]
fn drafts_survive_reopening_the_device_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("device.db");
    let dm = Channel::Direct("conv-1".into());

    {
        let kv: Arc<dyn KeyValueStore> = Arc::new(SledStore::open(&path).unwrap());
        DraftStore::new(kv).save(&dm, "half-typed thought").unwrap();
    }

    let kv: Arc<dyn KeyValueStore> = Arc::new(SledStore::open(&path).unwrap());
    let drafts = DraftStore::new(kv);
    assert_eq!(drafts.load(&dm).unwrap().as_deref(), Some("half-typed thought"));

    drafts.clear(&dm).unwrap();
    assert_eq!(drafts.load(&dm).unwrap(), None);
}

#[test]
fn image_cache_eviction_works_on_sled() {
    let dir = tempfile::tempdir().unwrap();
    let kv: Arc<dyn KeyValueStore> = Arc::new(SledStore::open(dir.path().join("cache.db")).unwrap());
    let cache = ImageCache::new(kv.clone(), 2);

    cache.put("https://cdn.example/a.png", "data-a").unwrap();
    cache.put("https://cdn.example/b.png", "data-b").unwrap();
    cache.put("https://cdn.example/c.png", "data-c").unwrap();

    assert_eq!(cache.get("https://cdn.example/a.png").unwrap(), None);
    assert_eq!(cache.get("https://cdn.example/b.png").unwrap().as_deref(), Some("data-b"));
    assert_eq!(cache.get("https://cdn.example/c.png").unwrap().as_deref(), Some("data-c"));

    // The evicted entry's key is gone from the device store too.
    assert!(kv
        .keys()
        .unwrap()
        .iter()
        .all(|key| key != "image-cache-https://cdn.example/a.png"));
}
