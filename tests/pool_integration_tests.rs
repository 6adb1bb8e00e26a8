// tests/pool_integration_tests.rs

mod common;

use common::{CallLog, RecordingHooks, StatusClassifier, TestResponse};
use keymux::{
    BoxError, DispatchError, ExecuteOptions, HealthStatus, KeyConfig, KeyPool, PoolConfig,
    QuotaSpec,
};
use std::collections::HashSet;
use std::future::Ready;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

type TestResult = std::result::Result<TestResponse, BoxError>;

/// Request function that walks a status script: call i returns script[i],
/// sticking on the last entry once the script runs out.
fn scripted(
    log: Arc<CallLog>,
    script: Vec<u16>,
) -> impl Fn(String) -> Ready<TestResult> + Send + Sync + 'static {
    move |key| {
        let i = log.next(&key);
        let status = *script.get(i).unwrap_or_else(|| script.last().unwrap());
        std::future::ready(Ok(TestResponse::status(status, key)))
    }
}

fn three_keys() -> Vec<KeyConfig> {
    vec![
        KeyConfig::new("key-1", "secret-1").with_rps(100.0),
        KeyConfig::new("key-2", "secret-2").with_rps(100.0),
        KeyConfig::new("key-3", "secret-3").with_rps(100.0),
    ]
}

#[tokio::test]
async fn e1_rotates_across_keys_on_rate_limit() {
    common::init_tracing();
    let pool = KeyPool::builder(StatusClassifier)
        .keys(three_keys())
        .build()
        .unwrap();

    let log = Arc::new(CallLog::default());
    let response = pool
        .execute(scripted(log.clone(), vec![429, 429, 200]))
        .await
        .expect("third key succeeds");
    assert_eq!(response.status, 200);

    let calls = log.calls();
    assert_eq!(calls.len(), 3);
    let distinct: HashSet<&String> = calls.iter().collect();
    assert_eq!(distinct.len(), 3, "every attempt used a different key");

    // The two 429'd keys sit out a rate-limit window; the winner does not.
    let winner = response.key.trim_start_matches("secret-");
    for stats in pool.get_all_key_stats().await {
        let got_429 = stats.id.trim_start_matches("key-") != winner;
        assert_eq!(stats.is_rate_limited, got_429, "key {}", stats.id);
    }
}

#[tokio::test]
async fn e2_rejects_when_every_key_rate_limits() {
    let pool = KeyPool::builder(StatusClassifier)
        .keys(vec![
            KeyConfig::new("key-1", "secret-1"),
            KeyConfig::new("key-2", "secret-2"),
        ])
        .config(PoolConfig {
            max_retries: Some(2),
            ..PoolConfig::default()
        })
        .build()
        .unwrap();

    let log = Arc::new(CallLog::default());
    let err = pool
        .execute(scripted(log.clone(), vec![429]))
        .await
        .unwrap_err();
    match err {
        DispatchError::AllKeysExhausted { total_keys, .. } => assert_eq!(total_keys, 2),
        other => panic!("expected AllKeysExhausted, got {other:?}"),
    }
    assert_eq!(log.count(), 2, "one attempt per key");
}

#[tokio::test]
async fn e3_warning_fires_exactly_once_at_threshold() {
    let hooks = Arc::new(RecordingHooks::default());
    let pool = KeyPool::builder(StatusClassifier)
        .key(KeyConfig::new("key-1", "secret-1").with_quota(QuotaSpec::Monthly { limit: 10 }))
        .hooks(hooks.clone())
        .build()
        .unwrap();

    let log = Arc::new(CallLog::default());
    for _ in 0..8 {
        pool.execute(scripted(log.clone(), vec![200])).await.unwrap();
    }

    let warnings = hooks.warnings.lock().unwrap().clone();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].0, "key-1");
    assert!((warnings[0].1 - 0.8).abs() < 1e-9);
}

#[tokio::test]
async fn e4_circuit_opens_after_three_server_errors() {
    let hooks = Arc::new(RecordingHooks::default());
    let pool = KeyPool::builder(StatusClassifier)
        .key(KeyConfig::new("key-1", "secret-1"))
        .config(PoolConfig {
            failure_threshold: 3,
            ..PoolConfig::default()
        })
        .hooks(hooks.clone())
        .build()
        .unwrap();

    let log = Arc::new(CallLog::default());
    for _ in 0..3 {
        let err = pool
            .execute(scripted(log.clone(), vec![500]))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::AllKeysExhausted { .. }));
    }

    let stats = pool.get_key_stats("key-1").await.unwrap();
    assert!(stats.is_circuit_open);
    assert_eq!(stats.consecutive_failures, 3);
    assert_eq!(hooks.circuit_opened_for("key-1"), 1, "hook fires on the transition only");
    assert_eq!(pool.get_health().await.status, HealthStatus::Exhausted);

    // Failing fast now: the request function is not invoked again.
    let err = pool
        .execute(scripted(log.clone(), vec![200]))
        .await
        .unwrap_err();
    match err {
        DispatchError::AllKeysExhausted {
            circuit_open_keys, ..
        } => assert_eq!(circuit_open_keys, 1),
        other => panic!("expected AllKeysExhausted, got {other:?}"),
    }
    assert_eq!(log.count(), 3);
    assert_eq!(hooks.all_exhausted_count(), 1);
}

#[tokio::test]
async fn e5_circuit_recovers_through_half_open_probe() {
    let pool = KeyPool::builder(StatusClassifier)
        .key(KeyConfig::new("key-1", "secret-1"))
        .config(PoolConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_millis(100),
            ..PoolConfig::default()
        })
        .build()
        .unwrap();

    let log = Arc::new(CallLog::default());
    for _ in 0..3 {
        let _ = pool.execute(scripted(log.clone(), vec![500])).await;
    }
    assert!(pool.get_key_stats("key-1").await.unwrap().is_circuit_open);

    // Past the reset timeout the observed state is half-open.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!pool.get_key_stats("key-1").await.unwrap().is_circuit_open);

    // A successful probe closes it and clears the failure counter.
    let response = pool
        .execute(scripted(log.clone(), vec![200]))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    let stats = pool.get_key_stats("key-1").await.unwrap();
    assert!(!stats.is_circuit_open);
    assert_eq!(stats.consecutive_failures, 0);
}

#[tokio::test]
async fn e7_queue_full_rejects_immediately() {
    let gate = Arc::new(Semaphore::new(0));
    let pool = Arc::new(
        KeyPool::builder(StatusClassifier)
            .key(KeyConfig::new("key-1", "secret-1"))
            .config(PoolConfig {
                max_queue_size: 2,
                ..PoolConfig::default()
            })
            .build()
            .unwrap(),
    );

    let blocking = |gate: Arc<Semaphore>| {
        move |key: String| {
            let gate = gate.clone();
            async move {
                let permit = gate.acquire_owned().await.expect("gate open");
                permit.forget();
                Ok::<_, BoxError>(TestResponse::ok(key))
            }
        }
    };

    // One request in flight (dequeued, blocked inside the function), two
    // more waiting in the queue.
    let mut submitted = Vec::new();
    for _ in 0..3 {
        let pool = pool.clone();
        let attempt = blocking(gate.clone());
        submitted.push(tokio::spawn(async move { pool.execute(attempt).await }));
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pool.get_queue_size(), 2);

    let err = pool.execute(blocking(gate.clone())).await.unwrap_err();
    match err {
        DispatchError::QueueFull {
            queue_size,
            max_queue_size,
            retry_after_ms,
        } => {
            assert_eq!(queue_size, 2);
            assert_eq!(max_queue_size, 2);
            assert!(retry_after_ms >= 1_000);
        }
        other => panic!("expected QueueFull, got {other:?}"),
    }

    // Unblock everything and let the backlog drain.
    gate.add_permits(3);
    for handle in submitted {
        assert!(handle.await.unwrap().is_ok());
    }
}

#[tokio::test]
async fn e8_weighted_selection_respects_weights() {
    let pool = KeyPool::builder(StatusClassifier)
        .keys(vec![
            KeyConfig::new("heavy", "secret-heavy").with_weight(2),
            KeyConfig::new("light", "secret-light").with_weight(1),
        ])
        .build()
        .unwrap();

    let log = Arc::new(CallLog::default());
    for _ in 0..9 {
        pool.execute(scripted(log.clone(), vec![200])).await.unwrap();
    }

    let calls = log.calls();
    let heavy = calls.iter().filter(|key| *key == "secret-heavy").count();
    let light = calls.iter().filter(|key| *key == "secret-light").count();
    assert_eq!((heavy, light), (6, 3));
}

#[tokio::test]
async fn retries_cross_keys_with_distinct_attempts() {
    let pool = KeyPool::builder(StatusClassifier)
        .keys(three_keys())
        .build()
        .unwrap();

    let log = Arc::new(CallLog::default());
    let err = pool
        .execute(scripted(log.clone(), vec![500]))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::AllKeysExhausted { .. }));

    let calls = log.calls();
    assert_eq!(calls.len(), 3, "at most min(keys, max_retries) invocations");
    let distinct: HashSet<&String> = calls.iter().collect();
    assert_eq!(distinct.len(), 3);
}

#[tokio::test]
async fn thrown_errors_surface_as_upstream_after_rotation() {
    let pool = KeyPool::builder(StatusClassifier)
        .keys(vec![
            KeyConfig::new("key-1", "secret-1"),
            KeyConfig::new("key-2", "secret-2"),
        ])
        .build()
        .unwrap();

    let err = pool
        .execute(|_key: String| async move {
            Err::<TestResponse, BoxError>("connection refused".into())
        })
        .await
        .unwrap_err();
    match err {
        DispatchError::Upstream(source) => {
            assert!(source.to_string().contains("connection refused"));
        }
        other => panic!("expected Upstream, got {other:?}"),
    }
}

#[tokio::test]
async fn requests_complete_in_submission_order() {
    let pool = Arc::new(
        KeyPool::builder(StatusClassifier)
            .key(KeyConfig::new("key-1", "secret-1"))
            .build()
            .unwrap(),
    );

    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for i in 0..5usize {
        let pool = pool.clone();
        let order = order.clone();
        handles.push(tokio::spawn(async move {
            pool.execute(move |key: String| {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push(i);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok::<_, BoxError>(TestResponse::ok(key))
                }
            })
            .await
        }));
        // Space out submissions so arrival order is unambiguous.
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn queue_timeout_fails_stalled_requests() {
    let gate = Arc::new(Semaphore::new(0));
    let pool = Arc::new(
        KeyPool::builder(StatusClassifier)
            .key(KeyConfig::new("key-1", "secret-1"))
            .build()
            .unwrap(),
    );

    // Head of line: blocked inside the request function.
    let head = {
        let pool = pool.clone();
        let gate = gate.clone();
        tokio::spawn(async move {
            pool.execute(move |key: String| {
                let gate = gate.clone();
                async move {
                    let permit = gate.acquire_owned().await.expect("gate open");
                    permit.forget();
                    Ok::<_, BoxError>(TestResponse::ok(key))
                }
            })
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = pool
        .execute_with(
            |key: String| async move { Ok::<_, BoxError>(TestResponse::ok(key)) },
            ExecuteOptions {
                max_wait: Some(Duration::from_millis(100)),
            },
        )
        .await
        .unwrap_err();
    match err {
        DispatchError::QueueTimeout { waited_ms, .. } => assert!(waited_ms >= 100),
        other => panic!("expected QueueTimeout, got {other:?}"),
    }

    gate.add_permits(1);
    assert!(head.await.unwrap().is_ok());
}

#[tokio::test]
async fn rate_limit_backoff_honors_retry_after_hint() {
    let pool = KeyPool::builder(StatusClassifier)
        .keys(vec![
            KeyConfig::new("key-1", "secret-1"),
            KeyConfig::new("key-2", "secret-2"),
        ])
        .build()
        .unwrap();

    // key gets a 429 with a tiny Retry-After; the other carries the request.
    let log = Arc::new(CallLog::default());
    let first = {
        let log = log.clone();
        move |key: String| {
            let i = log.next(&key);
            let response = if i == 0 {
                TestResponse {
                    status: 429,
                    retry_after: Some(1),
                    quota_remaining: None,
                    key,
                }
            } else {
                TestResponse::ok(key)
            };
            std::future::ready(Ok::<_, BoxError>(response))
        }
    };
    let response = pool.execute(first).await.unwrap();
    assert_eq!(response.status, 200);

    let limited_id = format!("key-{}", log.calls()[0].trim_start_matches("secret-"));
    assert!(pool.get_key_stats(&limited_id).await.unwrap().is_rate_limited);

    // After the one-second window the key serves again.
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert!(!pool.get_key_stats(&limited_id).await.unwrap().is_rate_limited);
}

#[tokio::test]
async fn authoritative_quota_sync_never_rewinds() {
    let pool = KeyPool::builder(StatusClassifier)
        .key(KeyConfig::new("key-1", "secret-1").with_quota(QuotaSpec::Monthly { limit: 100 }))
        .build()
        .unwrap();

    // Server says only 40 remain: local accounting jumps to 60.
    pool.execute(|key: String| async move {
        Ok::<_, BoxError>(TestResponse {
            status: 200,
            retry_after: None,
            quota_remaining: Some(40),
            key,
        })
    })
    .await
    .unwrap();
    assert_eq!(pool.get_key_stats("key-1").await.unwrap().quota_used, 60);

    // Server later claims 99 remain: local accounting never rewinds.
    pool.execute(|key: String| async move {
        Ok::<_, BoxError>(TestResponse {
            status: 200,
            retry_after: None,
            quota_remaining: Some(99),
            key,
        })
    })
    .await
    .unwrap();
    assert_eq!(pool.get_key_stats("key-1").await.unwrap().quota_used, 61);
}
