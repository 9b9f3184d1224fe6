use redis::AsyncCommands;
use secrecy::SecretString;
use std::sync::Arc;
use std::time::Duration;

use tiergate_internal::error::ErrorDetails;
use tiergate_internal::policy::B2bTier;
use tiergate_internal::rate_limit::{
    fingerprint_api_key, ApiKeyRecord, CachedKeyDirectory, KeyDirectory, KeyStatus,
    RedisKeyDirectory,
};

use crate::common::{redis_connection, redis_url, unique_prefix};

async fn put_record(prefix: &str, fingerprint: &str, json: &str) {
    let mut connection = redis_connection().await;
    let _: () = connection
        .set(format!("{prefix}:b2b_key:{fingerprint}"), json)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_lookup_provisioned_key() {
    let prefix = unique_prefix();
    let directory = RedisKeyDirectory::new(&redis_url(), prefix.clone())
        .await
        .unwrap();
    directory.health().await.unwrap();

    let fingerprint = fingerprint_api_key(&SecretString::from("tg_e2e_growth"));
    assert!(directory.lookup(&fingerprint).await.unwrap().is_none());

    put_record(
        &prefix,
        &fingerprint,
        r#"{"tier": "growth", "status": "active", "label": "partner"}"#,
    )
    .await;
    assert_eq!(
        directory.lookup(&fingerprint).await.unwrap(),
        Some(ApiKeyRecord::new(
            B2bTier::Growth,
            KeyStatus::Active,
            Some("partner")
        ))
    );
}

#[tokio::test]
async fn test_malformed_record_is_an_error() {
    let prefix = unique_prefix();
    let directory = RedisKeyDirectory::new(&redis_url(), prefix.clone())
        .await
        .unwrap();
    let fingerprint = fingerprint_api_key(&SecretString::from("tg_e2e_broken"));
    put_record(&prefix, &fingerprint, r#"{"tier": "platinum"}"#).await;

    let error = directory.lookup(&fingerprint).await.unwrap_err();
    assert!(matches!(
        error.get_details(),
        ErrorDetails::Serialization { .. }
    ));
}

#[tokio::test]
async fn test_cached_directory_serves_stale_status_until_ttl() {
    let prefix = unique_prefix();
    let inner = Arc::new(
        RedisKeyDirectory::new(&redis_url(), prefix.clone())
            .await
            .unwrap(),
    );
    let directory = CachedKeyDirectory::new(inner, Duration::from_millis(200));
    let fingerprint = fingerprint_api_key(&SecretString::from("tg_e2e_suspend_me"));

    put_record(
        &prefix,
        &fingerprint,
        r#"{"tier": "starter", "status": "active"}"#,
    )
    .await;
    let record = directory.lookup(&fingerprint).await.unwrap().unwrap();
    assert_eq!(record.status, KeyStatus::Active);

    put_record(
        &prefix,
        &fingerprint,
        r#"{"tier": "starter", "status": "suspended"}"#,
    )
    .await;
    let record = directory.lookup(&fingerprint).await.unwrap().unwrap();
    assert_eq!(record.status, KeyStatus::Active);

    tokio::time::sleep(Duration::from_millis(400)).await;
    let record = directory.lookup(&fingerprint).await.unwrap().unwrap();
    assert_eq!(record.status, KeyStatus::Suspended);
}
