//! SyncScheduler trigger tests, run on a paused clock.

use std::sync::Arc;
use std::time::Duration;

use canvass_sync::queue::PendingWriteQueue;
use canvass_sync::sync::{Connectivity, ReplayOutcome, SyncScheduler};

use super::support::{fill_queue, make_engine, memory_store, MockRemote};

const HOUR: Duration = Duration::from_secs(3600);

async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

#[tokio::test(start_paused = true)]
async fn interval_trigger_replays_periodically() {
    let queue = PendingWriteQueue::new(memory_store());
    fill_queue(&queue, 3);
    let remote = Arc::new(MockRemote::new());
    let engine = Arc::new(make_engine(
        Arc::new(queue.clone()),
        remote.clone(),
        Connectivity::online(),
        200,
        None,
    ));
    let scheduler = SyncScheduler::new(engine, Some(Duration::from_secs(30)));

    scheduler.start();
    settle().await;
    assert!(queue.is_empty().unwrap());
    assert_eq!(remote.commit_calls().len(), 1);

    fill_queue(&queue, 2);
    settle().await;
    assert_eq!(queue.len().unwrap(), 2);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(queue.is_empty().unwrap());
    assert_eq!(remote.commit_calls().len(), 2);

    scheduler.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn regaining_connectivity_triggers_replay() {
    let queue = PendingWriteQueue::new(memory_store());
    let connectivity = Connectivity::offline();
    let remote = Arc::new(MockRemote::new());
    let engine = Arc::new(make_engine(
        Arc::new(queue.clone()),
        remote.clone(),
        connectivity.clone(),
        200,
        None,
    ));
    let scheduler = SyncScheduler::new(engine, Some(HOUR));
    scheduler.start();
    settle().await;

    fill_queue(&queue, 4);
    settle().await;
    assert_eq!(queue.len().unwrap(), 4);

    assert!(connectivity.set_online(true));
    settle().await;
    assert!(queue.is_empty().unwrap());
    assert_eq!(remote.commit_calls().len(), 1);

    scheduler.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn going_offline_does_not_trigger_replay() {
    let queue = PendingWriteQueue::new(memory_store());
    let connectivity = Connectivity::online();
    let remote = Arc::new(MockRemote::new());
    let engine = Arc::new(make_engine(
        Arc::new(queue.clone()),
        remote.clone(),
        connectivity.clone(),
        200,
        None,
    ));
    let scheduler = SyncScheduler::new(engine, Some(HOUR));
    scheduler.start();
    settle().await;

    fill_queue(&queue, 1);
    connectivity.set_online(false);
    settle().await;
    assert_eq!(queue.len().unwrap(), 1);
    assert!(remote.commit_calls().is_empty());

    scheduler.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn request_sync_wakes_the_loop() {
    let queue = PendingWriteQueue::new(memory_store());
    let remote = Arc::new(MockRemote::new());
    let engine = Arc::new(make_engine(
        Arc::new(queue.clone()),
        remote.clone(),
        Connectivity::online(),
        200,
        None,
    ));
    let scheduler = SyncScheduler::new(engine, Some(HOUR));
    scheduler.start();
    settle().await;

    fill_queue(&queue, 2);
    scheduler.request_sync();
    settle().await;
    assert!(queue.is_empty().unwrap());
    assert_eq!(remote.commit_calls().len(), 1);

    scheduler.dispose().await;
}

#[tokio::test]
async fn sync_now_returns_the_outcome() {
    let queue = PendingWriteQueue::new(memory_store());
    fill_queue(&queue, 3);
    let engine = Arc::new(make_engine(
        Arc::new(queue.clone()),
        Arc::new(MockRemote::new()),
        Connectivity::online(),
        200,
        None,
    ));
    let scheduler = SyncScheduler::new(engine, None);

    let outcome = scheduler.sync_now().await;
    assert!(matches!(outcome, ReplayOutcome::Completed(ref r) if r.uploaded == 3));
    assert!(!scheduler.is_started());
}

#[tokio::test(start_paused = true)]
async fn dispose_stops_background_replay() {
    let queue = PendingWriteQueue::new(memory_store());
    let remote = Arc::new(MockRemote::new());
    let engine = Arc::new(make_engine(
        Arc::new(queue.clone()),
        remote.clone(),
        Connectivity::online(),
        200,
        None,
    ));
    let scheduler = SyncScheduler::new(engine, Some(Duration::from_secs(30)));
    scheduler.start();
    settle().await;

    scheduler.dispose().await;
    assert!(!scheduler.is_started());

    fill_queue(&queue, 1);
    scheduler.request_sync();
    scheduler.start();
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(queue.len().unwrap(), 1);
    assert!(remote.commit_calls().is_empty());
}

#[test]
fn zero_interval_falls_back_to_default() {
    let engine = Arc::new(make_engine(
        Arc::new(PendingWriteQueue::new(memory_store())),
        Arc::new(MockRemote::new()),
        Connectivity::online(),
        200,
        None,
    ));
    let scheduler = SyncScheduler::new(engine, Some(Duration::ZERO));
    assert_eq!(scheduler.interval(), Duration::from_secs(30));
}
