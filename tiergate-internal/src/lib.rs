pub mod config_parser; // configuration
pub mod endpoints; // API endpoints
pub mod error; // error handling
pub mod gateway_util; // utilities for gateway
pub mod metrics; // enforcement decision counters
pub mod observability; // utilities for observability (logs)
pub mod period; // counter windows
pub mod policy; // tier/feature catalog and resolver
pub mod quota; // consumer-tier quota enforcement
pub mod rate_limit; // B2B API key rate limiting
pub mod report; // caller-facing decision formatting
pub mod retries; // retry logic for usage store calls
pub mod usage_store; // counter persistence

mod testing;
