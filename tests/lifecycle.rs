//! Shutdown ordering, backpressure and boost behaviour of running queues.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use forge_queue::queue::{handler_fn, BoostState, Queue, QueueConfig, QueueState};
use forge_queue::GracefulManager;
use tokio::sync::Semaphore;

async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Handler that records each task once a permit is released for it.
fn gated(
    gate: Arc<Semaphore>,
    events: Arc<Mutex<Vec<String>>>,
) -> Arc<dyn forge_queue::Handler<String>> {
    Arc::new(handler_fn(move |tasks: Vec<String>| {
        let gate = Arc::clone(&gate);
        let events = Arc::clone(&events);
        async move {
            for task in tasks {
                events.lock().unwrap().push(format!("started {}", task));
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
                events.lock().unwrap().push(format!("handled {}", task));
            }
            Vec::new()
        }
    }))
}

#[tokio::test]
async fn test_terminate_runs_after_in_flight_batch() {
    let gate = Arc::new(Semaphore::new(0));
    let events = Arc::new(Mutex::new(Vec::new()));
    let config = QueueConfig::new("ordering").with_block_timeout(Duration::from_millis(20));
    let queue = Arc::new(
        Queue::new(config, gated(Arc::clone(&gate), Arc::clone(&events)))
            .await
            .unwrap(),
    );

    let graceful = Arc::new(GracefulManager::new());
    queue.run(&graceful).await.unwrap();
    let recorder = Arc::clone(&events);
    graceful.run_at_terminate("recorder", move || async move {
        recorder.lock().unwrap().push("terminate".to_string());
    });

    queue.push("in-flight".to_string()).await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        events.lock().unwrap().contains(&"started in-flight".to_string())
    })
    .await);

    let stopping = tokio::spawn({
        let graceful = Arc::clone(&graceful);
        async move { graceful.terminate().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!events.lock().unwrap().contains(&"terminate".to_string()));
    assert_eq!(queue.state(), QueueState::ShuttingDown);

    gate.add_permits(1);
    stopping.await.unwrap();

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            "started in-flight".to_string(),
            "handled in-flight".to_string(),
            "terminate".to_string(),
        ]
    );
    assert_eq!(queue.state(), QueueState::Terminated);
}

#[tokio::test]
async fn test_push_blocks_while_buffer_is_full() {
    let gate = Arc::new(Semaphore::new(0));
    let events = Arc::new(Mutex::new(Vec::new()));
    let config = QueueConfig::new("backpressure")
        .with_workers(1)
        .with_boost_workers(0)
        .with_batch_length(1)
        .with_queue_length(2)
        .with_block_timeout(Duration::from_millis(20));
    let queue = Arc::new(
        Queue::new(config, gated(Arc::clone(&gate), Arc::clone(&events)))
            .await
            .unwrap(),
    );
    let graceful = GracefulManager::new();
    queue.run(&graceful).await.unwrap();

    queue.push("task-0".to_string()).await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || !events.lock().unwrap().is_empty()).await);
    queue.push("task-1".to_string()).await.unwrap();
    queue.push("task-2".to_string()).await.unwrap();

    let blocked = tokio::time::timeout(
        Duration::from_millis(100),
        queue.push("task-3".to_string()),
    )
    .await;
    assert!(blocked.is_err(), "push must wait for buffer space");

    let pending = tokio::spawn({
        let queue = Arc::clone(&queue);
        async move { queue.push("task-3".to_string()).await }
    });
    gate.add_permits(1);
    tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("push should unblock once a slot frees")
        .unwrap()
        .unwrap();

    gate.add_permits(16);
    assert!(wait_until(Duration::from_secs(2), || queue.stats().tasks_handled == 4).await);
    graceful.terminate().await;
}

#[tokio::test]
async fn test_boost_workers_return_to_baseline() {
    let gate = Arc::new(Semaphore::new(0));
    let events = Arc::new(Mutex::new(Vec::new()));
    let config = QueueConfig::new("boost")
        .with_workers(1)
        .with_boost_workers(2)
        .with_batch_length(1)
        .with_queue_length(5)
        .with_block_timeout(Duration::from_millis(20))
        .with_boost_timeout(Duration::from_millis(200));
    let queue = Arc::new(
        Queue::new(config.clone(), gated(Arc::clone(&gate), Arc::clone(&events)))
            .await
            .unwrap(),
    );
    let graceful = GracefulManager::new();
    queue.run(&graceful).await.unwrap();

    for n in 0..6 {
        queue.push(format!("task-{}", n)).await.unwrap();
    }
    assert!(wait_until(Duration::from_secs(2), || queue.stats().live_workers == 3).await);
    assert!(queue.stats().live_workers <= config.max_workers());

    gate.add_permits(64);
    assert!(wait_until(Duration::from_secs(3), || queue.stats().live_workers == 1).await);
    assert_eq!(queue.stats().boost_state, BoostState::Idle);
    assert_eq!(queue.stats().tasks_handled, 6);

    graceful.terminate().await;
}
