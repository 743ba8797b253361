//! HTTP plumbing shared by the REST adapters
//!
//! Maps transport failures and HTTP statuses onto [`PlatformError`]:
//!
//! - timeouts → `Timeout`, connection failures → `Network`
//! - 401/403 → `Authentication`
//! - 404 → `NotFound`
//! - 429 (and Graph API throttling codes) → `RateLimit`
//! - other 4xx/5xx → `Api` with the platform's error message

use std::time::Duration;

use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::config::PlatformConfig;
use crate::error::{PlatformError, Result};
use crate::types::Platform;

/// Graph API error codes that mean "slow down"
const GRAPH_THROTTLE_CODES: [i64; 6] = [4, 17, 32, 613, 80001, 80002];
/// Graph API error code for an expired or revoked token
const GRAPH_INVALID_TOKEN: i64 = 190;

#[derive(Debug, Clone)]
pub struct ApiClient {
    platform: Platform,
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(platform: Platform, base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .user_agent(concat!("syndicast/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PlatformError::Network {
                platform,
                message: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            platform,
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(platform: Platform, default_base: &str, config: Option<&PlatformConfig>) -> Result<Self> {
        let base = config
            .and_then(|c| c.api_base.as_deref())
            .unwrap_or(default_base);
        let timeout = config
            .map(PlatformConfig::timeout)
            .unwrap_or(Duration::from_secs(30));
        Self::new(platform, base, timeout)
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub fn request(&self, method: Method, path: &str, token: &str) -> RequestBuilder {
        self.http.request(method, self.url(path)).bearer_auth(token)
    }

    /// Send and decode a JSON response body
    pub async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder, context: &str) -> Result<T> {
        let response = self.send(request, context).await?;
        let status = response.status();
        response.json::<T>().await.map_err(|e| {
            PlatformError::Api {
                platform: self.platform,
                status: status.as_u16(),
                message: format!("unexpected {} response: {}", context, e),
            }
            .into()
        })
    }

    /// Send, turning non-success statuses into errors
    pub async fn send(&self, request: RequestBuilder, context: &str) -> Result<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| self.transport_error(e, context))?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let retry_after = retry_after_secs(&response);
        let body = response.text().await.unwrap_or_default();
        tracing::debug!(
            platform = %self.platform,
            status = status.as_u16(),
            context = context,
            "Platform API call failed"
        );
        Err(self.status_error(status, &body, retry_after, context).into())
    }

    fn transport_error(&self, error: reqwest::Error, context: &str) -> PlatformError {
        if error.is_timeout() {
            PlatformError::Timeout {
                platform: self.platform,
                message: context.to_string(),
            }
        } else {
            PlatformError::Network {
                platform: self.platform,
                message: format!("{}: {}", context, error),
            }
        }
    }

    pub(crate) fn status_error(
        &self,
        status: StatusCode,
        body: &str,
        retry_after: Option<u64>,
        context: &str,
    ) -> PlatformError {
        let platform = self.platform;
        let detail = ApiErrorBody::parse(body);
        let message = detail
            .message
            .clone()
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());

        if status == StatusCode::TOO_MANY_REQUESTS
            || detail.code.is_some_and(|c| GRAPH_THROTTLE_CODES.contains(&c))
        {
            return PlatformError::RateLimit {
                platform,
                message,
                retry_after,
            };
        }

        if status == StatusCode::UNAUTHORIZED
            || status == StatusCode::FORBIDDEN
            || detail.code == Some(GRAPH_INVALID_TOKEN)
        {
            return PlatformError::Authentication { platform, message };
        }

        if status == StatusCode::NOT_FOUND {
            return PlatformError::NotFound {
                platform,
                external_id: context.to_string(),
            };
        }

        PlatformError::Api {
            platform,
            status: status.as_u16(),
            message: format!("{}: {}", context, message),
        }
    }
}

fn retry_after_secs(response: &Response) -> Option<u64> {
    let headers = response.headers();
    if let Some(value) = headers.get(reqwest::header::RETRY_AFTER) {
        return value.to_str().ok()?.trim().parse().ok();
    }
    // X reports the reset as an epoch second
    let reset: i64 = headers.get("x-rate-limit-reset")?.to_str().ok()?.parse().ok()?;
    let now = chrono::Utc::now().timestamp();
    u64::try_from(reset.saturating_sub(now)).ok()
}

/// Error message and code pulled from a platform error body
#[derive(Debug, Default, PartialEq)]
struct ApiErrorBody {
    message: Option<String>,
    code: Option<i64>,
}

impl ApiErrorBody {
    fn parse(body: &str) -> Self {
        let Ok(json) = serde_json::from_str::<serde_json::Value>(body) else {
            let trimmed = body.trim();
            return Self {
                message: (!trimmed.is_empty()).then(|| trimmed.chars().take(200).collect()),
                code: None,
            };
        };

        // Graph API: {"error": {"message": "...", "code": 190}}
        if let Some(error) = json.get("error").filter(|e| e.is_object()) {
            return Self {
                message: error["message"].as_str().map(str::to_string),
                code: error["code"].as_i64(),
            };
        }

        // X API v2: {"detail": "...", "title": "..."} or {"errors": [{"message": "..."}]}
        let message = json["detail"]
            .as_str()
            .or_else(|| json["errors"][0]["message"].as_str())
            .or_else(|| json["title"].as_str())
            .map(str::to_string);

        Self {
            message,
            code: json["errors"][0]["code"].as_i64(),
        }
    }
}
