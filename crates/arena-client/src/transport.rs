//! HTTP transport helpers: credential application and status
//! classification.
//!
//! Every outbound call goes through [`ensure_ok`] so the whole client
//! shares one mapping from HTTP status to the error taxonomy.

use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;

use arena_core::session::CredentialSnapshot;
use arena_core::{ArenaError, Result};

/// Body fragments that mark an anti-bot interstitial or a challenge-token
/// rejection, as opposed to a plain permission failure.
const CHALLENGE_MARKERS: &[&str] = &[
    "cf-challenge",
    "cf_chl_opt",
    "Just a moment",
    "Attention Required",
    "cloudflare",
    "recaptcha",
    "captcha",
];

/// Build the HTTP client used for one logical operation.
pub fn build_client(timeout: Duration) -> Result<Client> {
    Ok(Client::builder().timeout(timeout).build()?)
}

/// Attach a credential snapshot to a request: every template header plus
/// the folded `cookie` header.
pub fn apply_credentials(mut builder: RequestBuilder, creds: &CredentialSnapshot) -> RequestBuilder {
    for (name, value) in &creds.headers {
        builder = builder.header(name, value);
    }
    if !creds.cookies.is_empty() {
        builder = builder.header("cookie", creds.cookie_header());
    }
    builder
}

/// Pass 2xx responses through, classify everything else.
///
/// 429 and 402 are rate limits; 401 is an auth failure; 403 is a challenge
/// block when the body carries anti-bot markers and a plain forbidden
/// otherwise; everything else is an upstream error.
pub async fn ensure_ok(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().clone();
    let reason = status.canonical_reason().unwrap_or("HTTP error").to_string();
    let body = response.text().await.unwrap_or_default();
    let detail = body_detail(&body).unwrap_or_else(|| reason.clone());

    tracing::warn!(status = status.as_u16(), %url, detail, "request failed");

    let code = status.as_u16();
    Err(match code {
        429 | 402 => ArenaError::RateLimited(format!("HTTP {code}: {detail}")),
        401 => ArenaError::AuthFailure(format!("HTTP {code}: {detail}")),
        403 if has_challenge_markers(&body) => {
            ArenaError::ChallengeBlocked("HTTP 403: blocked by anti-bot challenge".into())
        }
        403 => ArenaError::Forbidden(format!("HTTP {code}: {detail}")),
        _ => ArenaError::Upstream {
            status: code,
            message: detail,
        },
    })
}

fn has_challenge_markers(body: &str) -> bool {
    CHALLENGE_MARKERS.iter().any(|m| body.contains(m))
}

/// Best-effort extraction of a human-readable detail from a JSON error
/// body.
fn body_detail(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body.trim()).ok()?;
    for key in ["error", "detail", "message"] {
        match value.get(key) {
            Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(Value::Object(obj)) => {
                if let Some(Value::String(s)) = obj.get("message") {
                    return Some(s.clone());
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn classify(template: ResponseTemplate) -> ArenaError {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(template)
            .mount(&server)
            .await;
        let response = reqwest::get(server.uri()).await.unwrap();
        ensure_ok(response).await.unwrap_err()
    }

    #[tokio::test]
    async fn success_passes_through() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;
        let response = reqwest::get(server.uri()).await.unwrap();
        assert!(ensure_ok(response).await.is_ok());
    }

    #[tokio::test]
    async fn rate_limit_statuses() {
        assert_matches!(
            classify(ResponseTemplate::new(429)).await,
            ArenaError::RateLimited(_)
        );
        assert_matches!(
            classify(ResponseTemplate::new(402)).await,
            ArenaError::RateLimited(_)
        );
    }

    #[tokio::test]
    async fn unauthorized_is_auth_failure() {
        assert_matches!(
            classify(ResponseTemplate::new(401)).await,
            ArenaError::AuthFailure(_)
        );
    }

    #[tokio::test]
    async fn forbidden_with_markers_is_challenge_block() {
        let template = ResponseTemplate::new(403)
            .set_body_string("<html><title>Just a moment...</title></html>");
        assert_matches!(classify(template).await, ArenaError::ChallengeBlocked(_));
    }

    #[tokio::test]
    async fn plain_forbidden_stays_forbidden() {
        let template = ResponseTemplate::new(403).set_body_string("nope");
        assert_matches!(classify(template).await, ArenaError::Forbidden(_));
    }

    #[tokio::test]
    async fn other_statuses_carry_body_detail() {
        let template =
            ResponseTemplate::new(502).set_body_string(r#"{"error": "backend exploded"}"#);
        let err = classify(template).await;
        assert_matches!(
            err,
            ArenaError::Upstream { status: 502, ref message } if message == "backend exploded"
        );
    }

    #[tokio::test]
    async fn credentials_land_on_the_wire() {
        use std::collections::BTreeMap;

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(wiremock::matchers::header("cookie", "sid=abc"))
            .and(wiremock::matchers::header("user-agent", "UA/1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut cookies = BTreeMap::new();
        let _ = cookies.insert("sid".to_string(), "abc".to_string());
        let creds = CredentialSnapshot::new(&server.uri(), cookies, Some("UA/1"), None);

        let client = build_client(Duration::from_secs(5)).unwrap();
        let response = apply_credentials(client.get(server.uri()), &creds)
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());
    }

    #[test]
    fn body_detail_prefers_error_field() {
        assert_eq!(
            body_detail(r#"{"error": "x", "message": "y"}"#).as_deref(),
            Some("x")
        );
        assert_eq!(
            body_detail(r#"{"error": {"message": "nested"}}"#).as_deref(),
            Some("nested")
        );
        assert_eq!(body_detail("not json"), None);
    }
}
