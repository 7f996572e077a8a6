//! Tests for the file spool.

use std::sync::Arc;
use std::time::Duration;

use event_transmission::{FileStorage, NamedLockRegistry, StorageConfig, TransmissionStorage};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Item {
    n: u32,
}

fn open(dir: &TempDir, locks: Arc<NamedLockRegistry>) -> FileStorage<Item> {
    let config = StorageConfig {
        directory: dir.path().to_path_buf(),
        poll_interval: Duration::from_millis(10),
    };
    FileStorage::new(config, locks).unwrap()
}

async fn store(storage: &FileStorage<Item>, range: std::ops::Range<u32>) {
    let items = stream::iter(range.map(|n| Item { n })).boxed();
    storage.enqueue(items, CancellationToken::new()).await.unwrap();
}

#[tokio::test]
async fn test_items_are_read_back_in_write_order() {
    let dir = TempDir::new().unwrap();
    let storage = open(&dir, Arc::new(NamedLockRegistry::new()));

    store(&storage, 0..5).await;
    assert_eq!(storage.pending_count().unwrap(), 5);

    let items: Vec<Item> = storage.dequeue(CancellationToken::new()).take(5).collect().await;
    assert_eq!(items, (0..5).map(|n| Item { n }).collect::<Vec<_>>());
    assert_eq!(storage.pending_count().unwrap(), 0);
}

#[tokio::test]
async fn test_new_stream_resumes_after_consumed_items() {
    let dir = TempDir::new().unwrap();
    let storage = open(&dir, Arc::new(NamedLockRegistry::new()));
    store(&storage, 0..4).await;

    let first: Vec<Item> = storage.dequeue(CancellationToken::new()).take(2).collect().await;
    assert_eq!(first, vec![Item { n: 0 }, Item { n: 1 }]);

    let second: Vec<Item> = storage.dequeue(CancellationToken::new()).take(2).collect().await;
    assert_eq!(second, vec![Item { n: 2 }, Item { n: 3 }]);
}

#[tokio::test]
async fn test_spooled_items_survive_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let storage = open(&dir, Arc::new(NamedLockRegistry::new()));
        store(&storage, 0..3).await;
    }

    let reopened = open(&dir, Arc::new(NamedLockRegistry::new()));
    let items: Vec<Item> = tokio::time::timeout(
        Duration::from_secs(2),
        reopened.dequeue(CancellationToken::new()).take(3).collect(),
    )
    .await
    .unwrap();
    assert_eq!(items, (0..3).map(|n| Item { n }).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_cancelled_reader_leaves_files_stored() {
    let dir = TempDir::new().unwrap();
    let storage = open(&dir, Arc::new(NamedLockRegistry::new()));
    store(&storage, 0..2).await;

    let cancel = CancellationToken::new();
    let stream = storage.dequeue(cancel.clone());
    cancel.cancel();

    let items: Vec<Item> = tokio::time::timeout(Duration::from_secs(2), stream.collect())
        .await
        .expect("cancelled reader should end");
    assert!(items.is_empty());
    assert_eq!(storage.pending_count().unwrap(), 2);
}

#[tokio::test]
async fn test_reader_stops_mid_backlog_on_cancel() {
    let dir = TempDir::new().unwrap();
    let storage = open(&dir, Arc::new(NamedLockRegistry::new()));
    store(&storage, 0..5).await;

    let cancel = CancellationToken::new();
    let mut stream = storage.dequeue(cancel.clone());
    assert_eq!(stream.next().await, Some(Item { n: 0 }));
    cancel.cancel();

    assert_eq!(stream.next().await, None);
    assert_eq!(storage.pending_count().unwrap(), 4);
}

#[tokio::test]
async fn test_idle_reader_picks_up_later_writes() {
    let dir = TempDir::new().unwrap();
    let storage = open(&dir, Arc::new(NamedLockRegistry::new()));
    let mut stream = storage.dequeue(CancellationToken::new());

    let writer = storage.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        store(&writer, 7..8).await;
    });

    let item = tokio::time::timeout(Duration::from_secs(2), stream.next()).await.unwrap();
    assert_eq!(item, Some(Item { n: 7 }));
}

#[tokio::test]
async fn test_undecodable_file_is_discarded() {
    let dir = TempDir::new().unwrap();
    let storage = open(&dir, Arc::new(NamedLockRegistry::new()));
    std::fs::write(dir.path().join("00000000000000000000-garbage.tse"), b"not json").unwrap();
    std::fs::write(dir.path().join("notes.txt"), b"left alone").unwrap();
    store(&storage, 1..2).await;

    let items: Vec<Item> = tokio::time::timeout(
        Duration::from_secs(2),
        storage.dequeue(CancellationToken::new()).take(1).collect(),
    )
    .await
    .unwrap();

    assert_eq!(items, vec![Item { n: 1 }]);
    assert!(!dir.path().join("00000000000000000000-garbage.tse").exists());
    assert!(dir.path().join("notes.txt").exists());
}

#[tokio::test]
async fn test_reader_waits_for_writer_holding_the_file() {
    let dir = TempDir::new().unwrap();
    let locks = Arc::new(NamedLockRegistry::new());
    let storage = open(&dir, locks.clone());

    let name = "00000000000000000001-0000000000-held.tse";
    let cancel = CancellationToken::new();
    let writer = locks.acquire_write(name, &cancel).await.unwrap();
    std::fs::write(dir.path().join(name), serde_json::to_vec(&Item { n: 9 }).unwrap()).unwrap();

    let mut stream = storage.dequeue(CancellationToken::new());
    let reader = tokio::spawn(async move { stream.next().await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!reader.is_finished(), "file is still locked by its writer");

    drop(writer);
    let item = tokio::time::timeout(Duration::from_secs(2), reader).await.unwrap().unwrap();
    assert_eq!(item, Some(Item { n: 9 }));
}

#[tokio::test]
async fn test_file_being_written_is_invisible_to_readers() {
    let dir = TempDir::new().unwrap();
    let storage = open(&dir, Arc::new(NamedLockRegistry::new()));

    let partial = dir.path().join("00000000000000000001-0000000000-partial.tse.tmp");
    std::fs::write(&partial, b"{\"n\":").unwrap();
    assert_eq!(storage.pending_count().unwrap(), 0);

    let mut stream = storage.dequeue(CancellationToken::new());
    let early = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
    assert!(early.is_err(), "partial file must not be read");
    assert!(partial.exists());

    std::fs::write(&partial, serde_json::to_vec(&Item { n: 3 }).unwrap()).unwrap();
    std::fs::rename(&partial, dir.path().join("00000000000000000001-0000000000-partial.tse")).unwrap();

    let item = tokio::time::timeout(Duration::from_secs(2), stream.next()).await.unwrap();
    assert_eq!(item, Some(Item { n: 3 }));
}

#[tokio::test]
async fn test_writes_leave_no_partial_files() {
    let dir = TempDir::new().unwrap();
    let storage = open(&dir, Arc::new(NamedLockRegistry::new()));
    store(&storage, 0..10).await;

    let leftovers = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().and_then(|x| x.to_str()) != Some("tse"))
        .count();
    assert_eq!(leftovers, 0);
    assert_eq!(storage.pending_count().unwrap(), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_readers_see_only_complete_items() {
    let dir = TempDir::new().unwrap();
    let storage = open(&dir, Arc::new(NamedLockRegistry::new()));
    let cancel = CancellationToken::new();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let mut stream = storage.dequeue(cancel.clone());
            let tx = tx.clone();
            tokio::spawn(async move {
                while let Some(item) = stream.next().await {
                    let _ = tx.send(item);
                }
            })
        })
        .collect();

    let writer = storage.clone();
    let writes = tokio::spawn(async move {
        for n in 0..200u32 {
            store(&writer, n..n + 1).await;
            if n % 20 == 0 {
                tokio::task::yield_now().await;
            }
        }
    });

    let mut seen = std::collections::HashSet::new();
    while seen.len() < 200 {
        let item = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("an item was lost")
            .unwrap();
        assert!(seen.insert(item.n), "item {} delivered twice", item.n);
    }

    writes.await.unwrap();
    cancel.cancel();
    for reader in readers {
        reader.await.unwrap();
    }
    assert_eq!(storage.pending_count().unwrap(), 0);
}
