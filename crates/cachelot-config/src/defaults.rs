#![allow(clippy::redundant_pub_crate)]

//! Default values for optional settings fields.

pub(crate) const HOUSEHOLD_ACTIVITY_DAYS: u32 = 60;
pub(crate) const GUEST_ACTIVITY_DAYS: u32 = 14;
pub(crate) const REMOVED_RETENTION_DAYS: u32 = 30;

pub(crate) const fn min_gap_ms() -> u64 {
    1_000
}

pub(crate) const fn max_per_minute() -> u32 {
    30
}

pub(crate) const fn timeout_s() -> u64 {
    30
}

pub(crate) const fn max_retries() -> u32 {
    3
}

pub(crate) const fn retry_delay_s() -> u64 {
    2
}

pub(crate) const fn token_cache_hours() -> u64 {
    24
}

pub(crate) const fn cycle_period_s() -> u64 {
    300
}

pub(crate) const fn reconcile_period_s() -> u64 {
    3_600
}

pub(crate) const fn max_concurrent_relocations() -> usize {
    4
}

pub(crate) const fn subscriber_queue_depth() -> usize {
    256
}

pub(crate) const fn cycle_history() -> usize {
    50
}

pub(crate) const fn list_refresh_period_s() -> u64 {
    21_600
}

pub(crate) const fn list_count_cap() -> usize {
    25
}

pub(crate) fn log_level() -> String {
    "info".to_string()
}
