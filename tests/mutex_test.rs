//! Tests for AsyncMutex exclusion under concurrency.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stepwise::AsyncMutex;
use tokio::sync::Mutex;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_critical_sections_do_not_interleave() {
    const CALLERS: usize = 8;
    const APPENDS: usize = 3;

    let mutex = Arc::new(AsyncMutex::new());
    let log = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..CALLERS)
        .map(|caller| {
            let mutex = mutex.clone();
            let log = log.clone();
            tokio::spawn(async move {
                mutex
                    .lock(|| async move {
                        for _ in 0..APPENDS {
                            log.lock().await.push(caller);
                            tokio::time::sleep(Duration::from_millis(2)).await;
                        }
                    })
                    .await
                    .unwrap();
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap();
    }

    let log = log.lock().await.clone();
    assert_eq!(log.len(), CALLERS * APPENDS);
    for segment in log.chunks(APPENDS) {
        assert!(
            segment.iter().all(|c| *c == segment[0]),
            "interleaved appends: {:?}",
            log
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_at_most_one_holder() {
    let mutex = Arc::new(AsyncMutex::new());
    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let mutex = mutex.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            tokio::spawn(async move {
                mutex
                    .lock(|| async move {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    assert!(!mutex.is_locked());
}

#[tokio::test]
async fn test_waiters_fail_after_close() {
    let mutex = Arc::new(AsyncMutex::new());
    let release = Arc::new(tokio::sync::Notify::new());

    let holder = {
        let mutex = mutex.clone();
        let release = release.clone();
        tokio::spawn(async move { mutex.lock(|| async move { release.notified().await }).await })
    };
    tokio::task::yield_now().await;
    assert!(mutex.is_locked());

    let waiter = {
        let mutex = mutex.clone();
        tokio::spawn(async move { mutex.lock(|| async { "never" }).await })
    };
    tokio::task::yield_now().await;

    mutex.close();
    release.notify_one();

    // The holder finishes normally, the waiter is turned away.
    assert!(holder.await.unwrap().is_ok());
    assert!(waiter.await.unwrap().is_err());
}
