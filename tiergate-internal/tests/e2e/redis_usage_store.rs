use chrono::{DateTime, TimeDelta, Utc};
use secrecy::SecretString;
use std::collections::HashSet;
use std::sync::Arc;

use tiergate_internal::period::Period;
use tiergate_internal::policy::{B2bTier, Tier};
use tiergate_internal::quota::{Principal, QuotaEnforcer, Remaining};
use tiergate_internal::rate_limit::{
    fingerprint_api_key, ApiKeyRecord, B2bDecision, KeyStatus, RateLimiter, StaticKeyDirectory,
};
use tiergate_internal::usage_store::{ConsumeRequest, CounterRef, FailPolicy, WindowCharge};

use crate::common::{guard, metrics, policies, redis_store, unique_prefix};

fn charge(period: Period, dimension: &str, limit: u64, now: DateTime<Utc>) -> WindowCharge {
    WindowCharge {
        counter: CounterRef::new(&period.window(now), dimension),
        limit,
    }
}

#[tokio::test]
async fn test_consume_is_all_or_nothing_across_windows() {
    let store = redis_store(&unique_prefix()).await;
    let now = Utc::now();
    let new_request = || {
        ConsumeRequest::new(
            "b2b:all-or-nothing",
            vec![
                charge(Period::Minute, "requests", 5, now),
                charge(Period::Day, "requests", 2, now),
            ],
            1,
            now,
        )
    };

    for expected_before in [0, 1] {
        let outcome = store.consume(&new_request()).await.unwrap();
        assert!(outcome.applied);
        assert_eq!(outcome.counts_before, vec![expected_before, expected_before]);
    }

    // The day window is full, so the minute window must not move either
    let request = new_request();
    let outcome = store.consume(&request).await.unwrap();
    assert!(!outcome.applied);
    assert_eq!(outcome.counts_before, vec![2, 2]);

    let counters: Vec<CounterRef> = request.charges.iter().map(|c| c.counter.clone()).collect();
    let snapshot = store
        .snapshot(&request.principal_id, &counters, now)
        .await
        .unwrap();
    assert_eq!(snapshot.counts, vec![2, 2]);
    assert_eq!(
        snapshot.last_consumed_at.map(|t| t.timestamp_millis()),
        Some(now.timestamp_millis())
    );
}

#[tokio::test]
async fn test_resubmitted_request_replays_first_outcome() {
    let store = redis_store(&unique_prefix()).await;
    let now = Utc::now();
    let request = ConsumeRequest::new(
        "user:resubmit",
        vec![charge(Period::Day, "player_comparison", 3, now)],
        1,
        now,
    );

    let first = store.consume(&request).await.unwrap();
    let replayed = store.consume(&request).await.unwrap();
    assert!(first.applied);
    assert_eq!(replayed, first);

    let snapshot = store
        .snapshot(
            "user:resubmit",
            &[request.charges[0].counter.clone()],
            now,
        )
        .await
        .unwrap();
    assert_eq!(snapshot.counts, vec![1]);
}

#[tokio::test]
async fn test_snapshot_of_unknown_principal_is_zero() {
    let store = redis_store(&unique_prefix()).await;
    let now = Utc::now();
    let snapshot = store
        .snapshot(
            "user:nobody",
            &[CounterRef::new(&Period::Day.window(now), "player_comparison")],
            now,
        )
        .await
        .unwrap();
    assert_eq!(snapshot.counts, vec![0]);
    assert!(snapshot.last_consumed_at.is_none());
}

#[tokio::test]
async fn test_closed_window_reads_as_zero_during_grace_period() {
    let store = redis_store(&unique_prefix()).await;
    let now = Utc::now();
    let window = Period::Minute.window(now);
    let counter = CounterRef::new(&window, "requests");
    let request = ConsumeRequest::new(
        "b2b:grace",
        vec![WindowCharge {
            counter: counter.clone(),
            limit: 10,
        }],
        3,
        now,
    );
    assert!(store.consume(&request).await.unwrap().applied);

    // The key is still in Redis for a short while, but its window is over
    let later = window.end + TimeDelta::seconds(1);
    let snapshot = store
        .snapshot("b2b:grace", &[counter], later)
        .await
        .unwrap();
    assert_eq!(snapshot.counts, vec![0]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_quota_consumption_never_overshoots() {
    let enforcer = Arc::new(QuotaEnforcer::new(
        policies(),
        guard(redis_store(&unique_prefix()).await),
        HashSet::new(),
        metrics(),
    ));
    let principal = Principal::new("user:racer", Tier::Free);
    let now = Utc::now();

    let mut handles = Vec::new();
    for _ in 0..40 {
        let enforcer = enforcer.clone();
        let principal = principal.clone();
        handles.push(tokio::spawn(async move {
            enforcer
                .check_and_consume(&principal, "player_comparison", 1, now)
                .await
                .unwrap()
        }));
    }

    let mut allowed = 0;
    for handle in handles {
        if handle.await.unwrap().allowed {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 3);

    let status = enforcer
        .usage_status(&principal, "player_comparison", now)
        .await
        .unwrap();
    assert!(!status.allowed);
    assert_eq!(status.remaining, Remaining::Count(0));
}

#[tokio::test]
async fn test_shared_store_is_seen_by_every_enforcer() {
    let prefix = unique_prefix();
    let first = QuotaEnforcer::new(
        policies(),
        guard(redis_store(&prefix).await),
        HashSet::new(),
        metrics(),
    );
    let second = QuotaEnforcer::new(
        policies(),
        guard(redis_store(&prefix).await),
        HashSet::new(),
        metrics(),
    );
    let principal = Principal::new("user:two-nodes", Tier::Free);
    let now = Utc::now();

    assert!(first
        .check_and_consume(&principal, "player_comparison", 2, now)
        .await
        .unwrap()
        .allowed);
    let result = second
        .check_and_consume(&principal, "player_comparison", 1, now)
        .await
        .unwrap();
    assert!(result.allowed);
    assert_eq!(result.remaining, Remaining::Count(0));
    assert!(!first
        .check_and_consume(&principal, "player_comparison", 1, now)
        .await
        .unwrap()
        .allowed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_b2b_dual_window_against_redis() {
    let api_key = SecretString::from("tg_e2e_starter");
    let keys = StaticKeyDirectory::from_records([(
        api_key.clone(),
        ApiKeyRecord::new(B2bTier::Starter, KeyStatus::Active, None),
    )]);
    let limiter = Arc::new(RateLimiter::new(
        Arc::new(keys),
        policies(),
        guard(redis_store(&unique_prefix()).await),
        FailPolicy::Closed,
        metrics(),
    ));
    let now = Utc::now();

    let mut handles = Vec::new();
    for _ in 0..50 {
        let limiter = limiter.clone();
        let api_key = api_key.clone();
        handles.push(tokio::spawn(async move {
            match limiter.allow(&api_key, now).await.unwrap() {
                B2bDecision::Evaluated(result) => result.allowed,
                B2bDecision::Rejected(rejection) => panic!("key rejected: {rejection}"),
            }
        }));
    }
    let mut allowed = 0;
    for handle in handles {
        if handle.await.unwrap() {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 30);

    let fingerprint = fingerprint_api_key(&api_key);
    let usage = limiter.key_usage(&fingerprint, now).await.unwrap().unwrap();
    assert_eq!(usage.usage.this_minute, 30);
    assert_eq!(usage.usage.today, 30);
    assert!(usage.usage.last_request_at.is_some());
}
