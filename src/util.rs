use base64::Engine as _;
use chrono::{DateTime, TimeZone as _, Utc};
use serde::Deserialize;
use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn redact_token_url(url: &str) -> String {
    let mut parsed = match reqwest::Url::parse(url) {
        Ok(url) => url,
        Err(_) => return "<invalid-url>".to_string(),
    };
    let pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(key, value)| {
            if key == "token" {
                (key.into_owned(), "***".to_string())
            } else {
                (key.into_owned(), value.into_owned())
            }
        })
        .collect();
    if !pairs.is_empty() {
        parsed.query_pairs_mut().clear().extend_pairs(pairs);
    }
    parsed.to_string()
}

pub(crate) fn truncate_message(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }

    let truncated: String = input.chars().take(max_chars).collect();
    format!("{truncated}...")
}

pub(crate) fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Deserialize)]
struct JwtClaims {
    exp: Option<i64>,
}

/// Reads the `exp` claim of a JWT access credential without verifying it.
///
/// Opaque (non-JWT) credentials yield `None`, which callers treat as
/// "unknown expiry" and leave to the server's 401.
pub(crate) fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let mut segments = token.split('.');
    let (_header, payload, _signature) = (segments.next()?, segments.next()?, segments.next()?);
    if segments.next().is_some() {
        return None;
    }
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claims: JwtClaims = serde_json::from_slice(&bytes).ok()?;
    Utc.timestamp_opt(claims.exp?, 0).single()
}

pub(crate) fn token_expires_within(token: &str, skew_secs: u64) -> bool {
    match jwt_expiry(token) {
        Some(expiry) => {
            let skew = chrono::Duration::seconds(skew_secs.min(86_400) as i64);
            expiry <= Utc::now() + skew
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jwt_with_exp(exp: i64) -> String {
        let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let header = engine.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = engine.encode(format!(r#"{{"exp":{exp},"user_id":7}}"#));
        format!("{header}.{payload}.c2lnbmF0dXJl")
    }

    #[test]
    fn redacts_token_query_parameter_only() {
        let redacted = redact_token_url("wss://api.example.com/ws/notifications/?token=abc&v=2");
        assert!(redacted.contains("token=***"));
        assert!(redacted.contains("v=2"));
        assert!(!redacted.contains("abc"));
        assert_eq!(redact_token_url("not a url"), "<invalid-url>");
    }

    #[test]
    fn truncates_on_char_boundaries() {
        assert_eq!(truncate_message("short", 10), "short");
        assert_eq!(truncate_message("žluťoučký", 4), "žluť...");
    }

    #[test]
    fn reads_jwt_expiry() {
        let token = jwt_with_exp(1_900_000_000);
        let expiry = jwt_expiry(&token).expect("expiry");
        assert_eq!(expiry.timestamp(), 1_900_000_000);
        assert_eq!(jwt_expiry("opaque-token"), None);
        assert_eq!(jwt_expiry("a.!!!.c"), None);
    }

    #[test]
    fn expiring_tokens_are_detected_with_skew() {
        let now = Utc::now().timestamp();
        assert!(token_expires_within(&jwt_with_exp(now - 5), 0));
        assert!(token_expires_within(&jwt_with_exp(now + 10), 30));
        assert!(!token_expires_within(&jwt_with_exp(now + 3600), 30));
        assert!(!token_expires_within("opaque-token", 30));
    }
}
