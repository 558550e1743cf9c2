use std::fmt;

/// Classified provider error — tells the turn *why* the LLM call failed so it
/// can pick the right recovery: retry, or surface to the user.
#[derive(Debug)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub status: Option<u16>,
    pub message: String,
    /// Seconds to wait before retrying (from a 429 body).
    pub retry_after_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// 401/403 — bad API key or permissions.
    Auth,
    /// 402 — billing/quota exhausted.
    Billing,
    /// 429 — rate limited; check retry_after_secs.
    RateLimit,
    /// 404 or "model not found".
    NotFound,
    /// 408 or the request ran past its deadline.
    Timeout,
    /// Connection refused, DNS failure, reset.
    Network,
    /// 500/502/503/504 — provider-side outage.
    ServerError,
    Unknown,
}

impl ProviderError {
    pub fn from_status(status: u16, body: &str) -> Self {
        let kind = match status {
            401 | 403 => ProviderErrorKind::Auth,
            402 => ProviderErrorKind::Billing,
            404 => ProviderErrorKind::NotFound,
            408 => ProviderErrorKind::Timeout,
            429 => ProviderErrorKind::RateLimit,
            500 | 502 | 503 | 504 => ProviderErrorKind::ServerError,
            _ => ProviderErrorKind::Unknown,
        };
        let retry_after_secs = if kind == ProviderErrorKind::RateLimit {
            extract_retry_after(body)
        } else {
            None
        };
        Self {
            kind,
            status: Some(status),
            message: truncate_body(body),
            retry_after_secs,
        }
    }

    pub fn network(err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ProviderErrorKind::Timeout
        } else {
            ProviderErrorKind::Network
        };
        Self {
            kind,
            status: None,
            message: err.to_string(),
            retry_after_secs: None,
        }
    }

    /// Short user-facing summary for the turn-failure reply.
    pub fn user_message(&self) -> String {
        match self.kind {
            ProviderErrorKind::Auth => "LLM authentication failed. Check the API key.".to_string(),
            ProviderErrorKind::Billing => {
                "LLM billing error — the account quota may be exhausted.".to_string()
            }
            ProviderErrorKind::RateLimit => "Rate limited by the LLM provider. Try again shortly.".to_string(),
            ProviderErrorKind::NotFound => "The configured model was not found.".to_string(),
            ProviderErrorKind::Timeout => "The LLM request timed out.".to_string(),
            ProviderErrorKind::Network => "Cannot reach the LLM provider (network error).".to_string(),
            ProviderErrorKind::ServerError => {
                "The LLM provider is having trouble (server error). Try again shortly.".to_string()
            }
            ProviderErrorKind::Unknown => format!("LLM error: {}", self.message),
        }
    }

    /// Worth one retry with the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ProviderErrorKind::RateLimit
                | ProviderErrorKind::Timeout
                | ProviderErrorKind::Network
                | ProviderErrorKind::ServerError
        )
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "Provider error ({}, {:?}): {}", status, self.kind, self.message),
            None => write!(f, "Provider error ({:?}): {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for ProviderError {}

/// Parse retry_after from a JSON body: {"error":{"retry_after":5}} or
/// {"retry_after":5}.
fn extract_retry_after(body: &str) -> Option<u64> {
    let v: serde_json::Value = serde_json::from_str(body).ok()?;
    v["error"]["retry_after"]
        .as_u64()
        .or_else(|| v["retry_after"].as_u64())
}

fn truncate_body(body: &str) -> String {
    if body.len() > 300 {
        let mut end = 300;
        while end > 0 && !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &body[..end])
    } else {
        body.to_string()
    }
}
