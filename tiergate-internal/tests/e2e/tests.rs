//! End-to-end tests against a real Redis, selected with `--features e2e_tests`.
//!
//! Point `TIERGATE_REDIS_URL` at a disposable instance. Every test uses its own key prefix,
//! so tests can run in parallel against the same database.

mod common;
mod redis_key_directory;
mod redis_usage_store;
