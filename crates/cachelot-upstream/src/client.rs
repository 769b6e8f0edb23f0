//! Rate-limited HTTP client for the upstream media server.
//!
//! All calls serialize through one queue: concurrent callers line up on an
//! async mutex and each request passes the rate gate before it is issued.
//! Transient failures retry with jittered exponential backoff; 4xx responses
//! never retry.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use cachelot_config::UpstreamSettings;
use cachelot_core::error::{UpstreamError, UpstreamResult};
use cachelot_core::model::{
    ListItem, MediaKind, MediaRef, PlaybackSession, User, UserKind, UserSourceSettings,
};
use cachelot_core::service::MediaServer;
use cachelot_telemetry::Metrics;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::rate::{RateGate, RatePolicy};

/// Connection parameters for one upstream server.
#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    /// Base URL of the media server API.
    pub base_url: String,
    /// Admin token used for discovery endpoints.
    pub token: String,
    /// Minimum gap between requests.
    pub min_gap: Duration,
    /// Maximum requests per sliding minute.
    pub max_per_minute: u32,
    /// Hard per-request timeout.
    pub timeout: Duration,
    /// Maximum retry attempts for transient failures.
    pub max_retries: u32,
    /// Base delay for exponential backoff.
    pub retry_delay: Duration,
    /// How long discovered per-user tokens stay cached.
    pub token_cache_ttl: Duration,
}

impl From<&UpstreamSettings> for UpstreamClientConfig {
    fn from(settings: &UpstreamSettings) -> Self {
        Self {
            base_url: settings.base_url.clone(),
            token: settings.token.clone(),
            min_gap: settings.min_gap(),
            max_per_minute: settings.max_per_minute,
            timeout: settings.timeout(),
            max_retries: settings.max_retries,
            retry_delay: settings.retry_delay(),
            token_cache_ttl: settings.token_cache_ttl(),
        }
    }
}

struct CachedToken {
    value: String,
    fetched_at: Instant,
}

/// Process-global handle to the upstream media server.
pub struct UpstreamClient {
    http: reqwest::Client,
    config: UpstreamClientConfig,
    gate: RateGate,
    queue: tokio::sync::Mutex<()>,
    tokens: Mutex<HashMap<Uuid, CachedToken>>,
    metrics: Metrics,
}

impl UpstreamClient {
    /// Construct a client for the configured server.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` if the HTTP client cannot be built.
    pub fn new(config: UpstreamClientConfig, metrics: Metrics) -> UpstreamResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| UpstreamError::Unavailable {
                operation: "client_build",
                detail: err.to_string(),
            })?;
        let gate = RateGate::new(RatePolicy {
            min_gap: config.min_gap,
            max_per_minute: config.max_per_minute,
        });
        Ok(Self {
            http,
            config,
            gate,
            queue: tokio::sync::Mutex::new(()),
            tokens: Mutex::new(HashMap::new()),
            metrics,
        })
    }

    async fn get_json(
        &self,
        operation: &'static str,
        path: &str,
        token: &str,
    ) -> UpstreamResult<serde_json::Value> {
        let _serialized = self.queue.lock().await;
        let url = format!("{}{path}", self.config.base_url.trim_end_matches('/'));

        let mut attempt: u32 = 0;
        loop {
            let waited = self.gate.acquire().await;
            self.metrics.observe_throttle_wait(waited);

            let response = self
                .http
                .get(&url)
                .header("X-Upstream-Token", token)
                .send()
                .await;

            match response {
                Ok(response) if response.status().is_success() => {
                    self.metrics.inc_upstream_request(operation, "ok");
                    return response.json().await.map_err(|err| {
                        UpstreamError::Malformed {
                            operation,
                            detail: err.to_string(),
                        }
                    });
                }
                Ok(response)
                    if response.status() == reqwest::StatusCode::UNAUTHORIZED
                        || response.status() == reqwest::StatusCode::FORBIDDEN =>
                {
                    self.metrics.inc_upstream_request(operation, "auth");
                    self.invalidate_tokens();
                    return Err(UpstreamError::Auth { operation });
                }
                Ok(response) if response.status().is_client_error() => {
                    self.metrics.inc_upstream_request(operation, "error");
                    return Err(UpstreamError::Malformed {
                        operation,
                        detail: format!("unexpected status {}", response.status()),
                    });
                }
                Ok(response) => {
                    let status = response.status();
                    if !self
                        .backoff(operation, &mut attempt, &format!("status {status}"))
                        .await
                    {
                        return Err(UpstreamError::Unavailable {
                            operation,
                            detail: format!("status {status}"),
                        });
                    }
                }
                Err(err) => {
                    if !self
                        .backoff(operation, &mut attempt, &err.to_string())
                        .await
                    {
                        return Err(UpstreamError::Unavailable {
                            operation,
                            detail: err.to_string(),
                        });
                    }
                }
            }
        }
    }

    /// Sleep the jittered exponential backoff for the next attempt. Returns
    /// whether another attempt is allowed.
    async fn backoff(&self, operation: &'static str, attempt: &mut u32, detail: &str) -> bool {
        *attempt += 1;
        if *attempt > self.config.max_retries {
            return false;
        }
        self.metrics.inc_upstream_request(operation, "retry");
        self.metrics.inc_upstream_retry();
        let delay = backoff_delay(self.config.retry_delay, *attempt);
        debug!(
            operation,
            attempt = *attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            detail,
            "retrying upstream request"
        );
        tokio::time::sleep(delay).await;
        true
    }

    async fn user_token(&self, user: &User) -> UpstreamResult<String> {
        if let Some(cached) = self.cached_token(user.id) {
            return Ok(cached);
        }
        if !user.token_opaque.is_empty() {
            self.store_token(user.id, user.token_opaque.clone());
            return Ok(user.token_opaque.clone());
        }

        let value = self
            .get_json(
                "user_token",
                &format!("/api/users/{}/token", user.id),
                &self.config.token,
            )
            .await?;
        let token = value
            .get("token")
            .and_then(serde_json::Value::as_str)
            .ok_or(UpstreamError::Malformed {
                operation: "user_token",
                detail: "missing token field".to_string(),
            })?
            .to_string();
        self.store_token(user.id, token.clone());
        Ok(token)
    }

    fn cached_token(&self, user_id: Uuid) -> Option<String> {
        let tokens = self.lock_tokens();
        tokens.get(&user_id).and_then(|cached| {
            (cached.fetched_at.elapsed() < self.config.token_cache_ttl)
                .then(|| cached.value.clone())
        })
    }

    fn store_token(&self, user_id: Uuid, value: String) {
        self.lock_tokens().insert(
            user_id,
            CachedToken {
                value,
                fetched_at: Instant::now(),
            },
        );
    }

    fn invalidate_tokens(&self) {
        self.lock_tokens().clear();
        warn!("auth failure; user token cache invalidated");
    }

    fn lock_tokens(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, CachedToken>> {
        self.tokens
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let doubled = base.saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
    let jitter = rand::rng().random_range(0.75..=1.25);
    doubled.mul_f64(jitter)
}

#[derive(Debug, Deserialize)]
struct UserDto {
    id: Uuid,
    name: String,
    kind: String,
    token: Option<String>,
    last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct MediaDto {
    path: String,
    size_bytes: Option<u64>,
    id: String,
    kind: String,
    last_watched_at: Option<DateTime<Utc>>,
    available_since: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct SessionDto {
    session_key: String,
    user_id: Option<Uuid>,
    media: MediaDto,
    playing_from_fast: Option<bool>,
}

fn media_from_dto(operation: &'static str, dto: MediaDto) -> UpstreamResult<MediaRef> {
    let kind = match dto.kind.as_str() {
        "movie" => MediaKind::Movie,
        "episode" => MediaKind::Episode,
        other => {
            return Err(UpstreamError::Malformed {
                operation,
                detail: format!("unknown media kind '{other}'"),
            });
        }
    };
    Ok(MediaRef {
        logical_path: dto.path.into(),
        size_bytes_hint: dto.size_bytes.unwrap_or_default(),
        upstream_id: dto.id,
        kind,
        last_watched_at: dto.last_watched_at,
        available_since: dto.available_since,
    })
}

fn parse_media_list(
    operation: &'static str,
    value: serde_json::Value,
) -> UpstreamResult<Vec<MediaRef>> {
    let dtos: Vec<MediaDto> =
        serde_json::from_value(value).map_err(|err| UpstreamError::Malformed {
            operation,
            detail: err.to_string(),
        })?;
    dtos.into_iter()
        .map(|dto| media_from_dto(operation, dto))
        .collect()
}

#[async_trait]
impl MediaServer for UpstreamClient {
    async fn list_users(&self) -> UpstreamResult<Vec<User>> {
        let value = self
            .get_json("list_users", "/api/users", &self.config.token)
            .await?;
        let dtos: Vec<UserDto> =
            serde_json::from_value(value).map_err(|err| UpstreamError::Malformed {
                operation: "list_users",
                detail: err.to_string(),
            })?;

        let mut users = Vec::with_capacity(dtos.len());
        for dto in dtos {
            let kind = UserKind::parse(&dto.kind).ok_or_else(|| UpstreamError::Malformed {
                operation: "list_users",
                detail: format!("unknown user kind '{}'", dto.kind),
            })?;
            let token = dto.token.unwrap_or_default();
            if !token.is_empty() {
                self.store_token(dto.id, token.clone());
            }
            users.push(User {
                id: dto.id,
                display_name: dto.name,
                kind,
                token_opaque: token,
                last_seen: dto.last_seen,
                enabled: true,
                priority_bias: 0,
                settings: UserSourceSettings::default(),
            });
        }
        Ok(users)
    }

    async fn on_deck(
        &self,
        user: &User,
        episodes_ahead: u32,
        max_stale_days: u32,
    ) -> UpstreamResult<Vec<MediaRef>> {
        let token = self.user_token(user).await?;
        let value = self
            .get_json(
                "on_deck",
                &format!(
                    "/api/users/{}/ondeck?limit={episodes_ahead}&max_stale_days={max_stale_days}",
                    user.id
                ),
                &token,
            )
            .await?;
        parse_media_list("on_deck", value)
    }

    async fn watchlist(
        &self,
        user: &User,
        episodes_per_show: u32,
        max_available_days: u32,
    ) -> UpstreamResult<Vec<MediaRef>> {
        let token = self.user_token(user).await?;
        let value = self
            .get_json(
                "watchlist",
                &format!(
                    "/api/users/{}/watchlist?per_show={episodes_per_show}\
                     &max_available_days={max_available_days}",
                    user.id
                ),
                &token,
            )
            .await?;
        parse_media_list("watchlist", value)
    }

    async fn active_sessions(&self) -> UpstreamResult<Vec<PlaybackSession>> {
        let value = self
            .get_json("active_sessions", "/api/sessions", &self.config.token)
            .await?;
        let dtos: Vec<SessionDto> =
            serde_json::from_value(value).map_err(|err| UpstreamError::Malformed {
                operation: "active_sessions",
                detail: err.to_string(),
            })?;
        dtos.into_iter()
            .map(|dto| {
                Ok(PlaybackSession {
                    session_key: dto.session_key,
                    user_id: dto.user_id,
                    media: media_from_dto("active_sessions", dto.media)?,
                    playing_from_fast: dto.playing_from_fast.unwrap_or_default(),
                })
            })
            .collect()
    }

    async fn match_library(&self, item: &ListItem) -> UpstreamResult<Option<MediaRef>> {
        // External identifiers first; title+year as the fallback.
        for (provider, id) in &item.external_ids {
            let value = self
                .get_json(
                    "match_library",
                    &format!("/api/library/match?provider={provider}&id={id}"),
                    &self.config.token,
                )
                .await?;
            if value.is_null() {
                continue;
            }
            let dto: MediaDto =
                serde_json::from_value(value).map_err(|err| UpstreamError::Malformed {
                    operation: "match_library",
                    detail: err.to_string(),
                })?;
            return media_from_dto("match_library", dto).map(Some);
        }

        let mut query = format!("/api/library/match?title={}", encode_query(&item.title));
        if let Some(year) = item.year {
            query.push_str(&format!("&year={year}"));
        }
        let value = self
            .get_json("match_library", &query, &self.config.token)
            .await?;
        if value.is_null() {
            return Ok(None);
        }
        let dto: MediaDto =
            serde_json::from_value(value).map_err(|err| UpstreamError::Malformed {
                operation: "match_library",
                detail: err.to_string(),
            })?;
        media_from_dto("match_library", dto).map(Some)
    }
}

fn encode_query(raw: &str) -> String {
    raw.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '~') {
                ch.to_string()
            } else {
                ch.to_string()
                    .bytes()
                    .fold(String::new(), |mut acc, byte| {
                        let _ = std::fmt::Write::write_fmt(
                            &mut acc,
                            format_args!("%{byte:02X}"),
                        );
                        acc
                    })
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_with_bounded_jitter() {
        let base = Duration::from_secs(2);
        for attempt in 1..=4u32 {
            let expected = base * (1 << (attempt - 1));
            let delay = backoff_delay(base, attempt);
            assert!(delay >= expected.mul_f64(0.75), "attempt {attempt} too fast");
            assert!(delay <= expected.mul_f64(1.25), "attempt {attempt} too slow");
        }
    }

    #[test]
    fn media_dto_conversion_validates_kinds() {
        let good = MediaDto {
            path: "/library/a.mkv".to_string(),
            size_bytes: Some(42),
            id: "m1".to_string(),
            kind: "movie".to_string(),
            last_watched_at: None,
            available_since: None,
        };
        let media = media_from_dto("test", good).expect("movie converts");
        assert_eq!(media.kind, MediaKind::Movie);
        assert_eq!(media.size_bytes_hint, 42);

        let bad = MediaDto {
            path: "/library/a.mkv".to_string(),
            size_bytes: None,
            id: "m1".to_string(),
            kind: "vinyl".to_string(),
            last_watched_at: None,
            available_since: None,
        };
        assert!(matches!(
            media_from_dto("test", bad),
            Err(UpstreamError::Malformed { .. })
        ));
    }

    #[test]
    fn query_encoding_escapes_reserved_characters() {
        assert_eq!(encode_query("Top Gun: Maverick"), "Top%20Gun%3A%20Maverick");
        assert_eq!(encode_query("plain-title_1.0~x"), "plain-title_1.0~x");
    }
}
