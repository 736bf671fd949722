//! Service configuration from environment variables

use crate::bulk::BulkConfig;
use crate::injector::InjectionPolicy;
use crate::store::{LockPolicy, StoreConfig};
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ApprovalConfig {
    pub db_path: PathBuf,
    pub port: u16,
    pub lock_policy: LockPolicy,
    pub lock_wait: Duration,
    pub store_timeout: Duration,
    pub bulk_concurrency: usize,
    pub bulk_page_size: usize,
    pub injection_policy: InjectionPolicy,
    pub change_feed_capacity: usize,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        Self {
            db_path: PathBuf::from(format!("{home}/.agronomic-approval/approval.db")),
            port: 8007,
            lock_policy: LockPolicy::Wait,
            lock_wait: Duration::from_millis(2000),
            store_timeout: Duration::from_millis(5000),
            bulk_concurrency: 8,
            bulk_page_size: 200,
            injection_policy: InjectionPolicy::SeparateConversation,
            change_feed_capacity: 256,
        }
    }
}

/// Parse `key` if set; keep `default` (with a warning) if it doesn't parse
fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: Display,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "Ignoring unparseable setting");
            default
        }
    }
}

impl ApprovalConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let millis = |key: &str, default: Duration| {
            Duration::from_millis(parsed(
                &lookup,
                key,
                u64::try_from(default.as_millis()).unwrap_or(u64::MAX),
            ))
        };

        Self {
            db_path: lookup("APPROVAL_DB_PATH").map_or(defaults.db_path, PathBuf::from),
            port: parsed(&lookup, "APPROVAL_PORT", defaults.port),
            lock_policy: parsed(&lookup, "APPROVAL_LOCK_POLICY", defaults.lock_policy),
            lock_wait: millis("APPROVAL_LOCK_WAIT_MS", defaults.lock_wait),
            store_timeout: millis("APPROVAL_STORE_TIMEOUT_MS", defaults.store_timeout),
            bulk_concurrency: parsed(&lookup, "APPROVAL_BULK_CONCURRENCY", defaults.bulk_concurrency)
                .max(1),
            bulk_page_size: parsed(&lookup, "APPROVAL_BULK_PAGE_SIZE", defaults.bulk_page_size)
                .max(1),
            injection_policy: parsed(
                &lookup,
                "APPROVAL_INJECTION_POLICY",
                defaults.injection_policy,
            ),
            change_feed_capacity: parsed(
                &lookup,
                "APPROVAL_CHANGE_FEED_CAPACITY",
                defaults.change_feed_capacity,
            )
            .max(1),
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            lock_policy: self.lock_policy,
            lock_wait: self.lock_wait,
            store_timeout: self.store_timeout,
            change_feed_capacity: self.change_feed_capacity,
        }
    }

    pub fn bulk_config(&self) -> BulkConfig {
        BulkConfig {
            concurrency: self.bulk_concurrency,
            page_size: self.bulk_page_size,
        }
    }
}
