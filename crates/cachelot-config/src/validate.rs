//! Validation of parsed settings documents.

use std::collections::HashSet;

use crate::error::{ConfigError, ConfigResult};
use crate::model::{ListDefinition, ProviderKind, Settings};

const MIN_GAP_RANGE_MS: (u64, u64) = (100, 10_000);
const PER_MINUTE_RANGE: (u32, u32) = (5, 120);
const LIST_BIAS_BOUND: i32 = 100;

/// Validate a parsed settings document before it becomes a snapshot.
///
/// # Errors
///
/// Returns the first `InvalidField` encountered; the load is all-or-nothing.
#[allow(clippy::redundant_pub_crate)]
pub(crate) fn validate(settings: &Settings) -> ConfigResult<()> {
    if settings.fast_root.as_os_str().is_empty() {
        return Err(ConfigError::invalid("root", "fast_root", "empty", None));
    }
    if !settings.fast_root.is_absolute() {
        return Err(ConfigError::invalid(
            "root",
            "fast_root",
            "not_absolute",
            Some(settings.fast_root.display().to_string()),
        ));
    }
    if settings.slow_roots.is_empty() {
        return Err(ConfigError::invalid("root", "slow_roots", "empty", None));
    }
    for slow in &settings.slow_roots {
        if !slow.is_absolute() {
            return Err(ConfigError::invalid(
                "root",
                "slow_roots",
                "not_absolute",
                Some(slow.display().to_string()),
            ));
        }
    }
    if settings.fast_limit_bytes == 0 {
        return Err(ConfigError::invalid(
            "root",
            "fast_limit_bytes",
            "zero",
            None,
        ));
    }
    if settings.cycle_period_s == 0 {
        return Err(ConfigError::invalid("root", "cycle_period_s", "zero", None));
    }
    if settings.max_concurrent_relocations == 0 {
        return Err(ConfigError::invalid(
            "root",
            "max_concurrent_relocations",
            "zero",
            None,
        ));
    }
    if settings.subscriber_queue_depth == 0 {
        return Err(ConfigError::invalid(
            "root",
            "subscriber_queue_depth",
            "zero",
            None,
        ));
    }
    if settings.cycle_history == 0 {
        return Err(ConfigError::invalid("root", "cycle_history", "zero", None));
    }

    validate_upstream(settings)?;
    validate_lists(&settings.lists)?;
    Ok(())
}

fn validate_upstream(settings: &Settings) -> ConfigResult<()> {
    let upstream = &settings.upstream;
    if upstream.base_url.trim().is_empty() {
        return Err(ConfigError::invalid("upstream", "base_url", "empty", None));
    }
    if upstream.token.trim().is_empty() {
        return Err(ConfigError::invalid("upstream", "token", "empty", None));
    }
    if !(MIN_GAP_RANGE_MS.0..=MIN_GAP_RANGE_MS.1).contains(&upstream.min_gap_ms) {
        return Err(ConfigError::invalid(
            "upstream",
            "min_gap_ms",
            "out_of_range",
            Some(upstream.min_gap_ms.to_string()),
        ));
    }
    if !(PER_MINUTE_RANGE.0..=PER_MINUTE_RANGE.1).contains(&upstream.max_per_minute) {
        return Err(ConfigError::invalid(
            "upstream",
            "max_per_minute",
            "out_of_range",
            Some(upstream.max_per_minute.to_string()),
        ));
    }
    if upstream.timeout_s == 0 {
        return Err(ConfigError::invalid("upstream", "timeout_s", "zero", None));
    }
    if upstream.retry_delay_s == 0 {
        return Err(ConfigError::invalid(
            "upstream",
            "retry_delay_s",
            "zero",
            None,
        ));
    }
    Ok(())
}

fn validate_lists(lists: &[ListDefinition]) -> ConfigResult<()> {
    let mut names = HashSet::new();
    for list in lists {
        if list.name.trim().is_empty() {
            return Err(ConfigError::invalid("lists", "name", "empty", None));
        }
        if !names.insert(list.name.as_str()) {
            return Err(ConfigError::invalid(
                "lists",
                "name",
                "duplicate",
                Some(list.name.clone()),
            ));
        }
        if list.priority_bias.abs() > LIST_BIAS_BOUND {
            return Err(ConfigError::invalid(
                "lists",
                "priority_bias",
                "out_of_range",
                Some(list.priority_bias.to_string()),
            ));
        }
        if list.count_cap == 0 {
            return Err(ConfigError::invalid(
                "lists",
                "count_cap",
                "zero",
                Some(list.name.clone()),
            ));
        }
        if list.refresh_period_s == 0 {
            return Err(ConfigError::invalid(
                "lists",
                "refresh_period_s",
                "zero",
                Some(list.name.clone()),
            ));
        }
        match list.provider {
            ProviderKind::CustomUrl if list.url.is_none() => {
                return Err(ConfigError::invalid(
                    "lists",
                    "url",
                    "required_for_custom_url",
                    Some(list.name.clone()),
                ));
            }
            ProviderKind::Personal if list.user.is_none() => {
                return Err(ConfigError::invalid(
                    "lists",
                    "user",
                    "required_for_personal",
                    Some(list.name.clone()),
                ));
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::tests::sample_settings;
    use crate::model::ListMode;

    #[test]
    fn accepts_sample_settings() -> ConfigResult<()> {
        validate(&sample_settings())
    }

    #[test]
    fn rejects_out_of_range_gap() {
        let mut settings = sample_settings();
        settings.upstream.min_gap_ms = 50;
        let err = validate(&settings).expect_err("gap below range must fail");
        assert!(matches!(
            err,
            ConfigError::InvalidField {
                field: "min_gap_ms",
                ..
            }
        ));
    }

    #[test]
    fn rejects_duplicate_list_names() {
        let mut settings = sample_settings();
        let list = ListDefinition {
            name: "trending".to_string(),
            provider: ProviderKind::Trending,
            url: None,
            user: None,
            priority_bias: 0,
            refresh_period_s: 3_600,
            mode: ListMode::Strict,
            count_cap: 10,
        };
        settings.lists = vec![list.clone(), list];
        let err = validate(&settings).expect_err("duplicate names must fail");
        assert!(matches!(
            err,
            ConfigError::InvalidField {
                reason: "duplicate",
                ..
            }
        ));
    }

    #[test]
    fn custom_url_provider_requires_url() {
        let mut settings = sample_settings();
        settings.lists = vec![ListDefinition {
            name: "feed".to_string(),
            provider: ProviderKind::CustomUrl,
            url: None,
            user: None,
            priority_bias: 0,
            refresh_period_s: 3_600,
            mode: ListMode::Fill,
            count_cap: 10,
        }];
        let err = validate(&settings).expect_err("custom_url without url must fail");
        assert!(matches!(
            err,
            ConfigError::InvalidField { field: "url", .. }
        ));
    }
}
