//! Access token record as returned by the vault token endpoint

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{REFRESH_WINDOW_HOURS, TOKEN_LEEWAY_SECS};

/// Token endpoint response, stamped with the time it was granted.
///
/// `expires_in` is a lifetime in seconds counted from `granted`. The server
/// does not send `granted`; it is set locally when the response arrives and
/// persisted with the cached record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: i64,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub granted: DateTime<Utc>,
}

impl TokenRecord {
    /// A record with neither token carries nothing usable.
    pub fn is_empty(&self) -> bool {
        self.access_token.is_empty() && self.refresh_token.is_empty()
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.granted
    }

    /// Whether the access token can still be used at `now`, keeping the
    /// leeway in reserve.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.access_token.is_empty()
            && self.age(now).num_seconds() + TOKEN_LEEWAY_SECS <= self.expires_in
    }

    /// Whether the refresh token is still inside its fixed window at `now`.
    pub fn refresh_window_open(&self, now: DateTime<Utc>) -> bool {
        let window = Duration::hours(REFRESH_WINDOW_HOURS) - Duration::seconds(TOKEN_LEEWAY_SECS);
        !self.refresh_token.is_empty() && self.age(now) <= window
    }

    /// Seconds the access token has left at `now`, never negative.
    pub fn seconds_remaining(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_in - self.age(now).num_seconds() - TOKEN_LEEWAY_SECS).max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(granted: DateTime<Utc>) -> TokenRecord {
        TokenRecord {
            access_token: "at_abc".into(),
            token_type: "bearer".into(),
            expires_in: 3600,
            refresh_token: "rt_def".into(),
            granted,
        }
    }

    #[test]
    fn deserializes_server_response_without_granted() {
        let json = r#"{"accessToken":"at_abc","tokenType":"bearer","expiresIn":3600,"refreshToken":"rt_def"}"#;
        let token: TokenRecord = serde_json::from_str(json).unwrap();
        assert_eq!(token.access_token, "at_abc");
        assert_eq!(token.refresh_token, "rt_def");
        assert_eq!(token.expires_in, 3600);
        assert_eq!(token.granted, DateTime::<Utc>::default());
    }

    #[test]
    fn serializes_camel_case_with_granted() {
        let now = Utc::now();
        let json = serde_json::to_value(record(now)).unwrap();
        assert_eq!(json["accessToken"], "at_abc");
        assert_eq!(json["expiresIn"], 3600);
        assert!(json["granted"].is_string());
        let back: TokenRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back.granted, now);
    }

    #[test]
    fn validity_respects_leeway() {
        let now = Utc::now();
        let token = record(now - Duration::seconds(3590));
        assert!(token.is_valid_at(now));
        assert!(!token.is_valid_at(now + Duration::seconds(1)));
        assert_eq!(token.seconds_remaining(now), 0);
    }

    #[test]
    fn fresh_token_is_valid() {
        let now = Utc::now();
        let token = record(now - Duration::seconds(60));
        assert!(token.is_valid_at(now));
        assert_eq!(token.seconds_remaining(now), 3600 - 60 - TOKEN_LEEWAY_SECS);
    }

    #[test]
    fn blank_access_token_is_never_valid() {
        let now = Utc::now();
        let mut token = record(now);
        token.access_token.clear();
        assert!(!token.is_valid_at(now));
        assert!(!token.is_empty());
        token.refresh_token.clear();
        assert!(token.is_empty());
    }

    #[test]
    fn refresh_window_is_fixed_720_hours() {
        let now = Utc::now();
        assert!(record(now - Duration::hours(719)).refresh_window_open(now));
        assert!(!record(now - Duration::hours(721)).refresh_window_open(now));

        let mut no_refresh = record(now);
        no_refresh.refresh_token.clear();
        assert!(!no_refresh.refresh_window_open(now));
    }
}
