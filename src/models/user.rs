use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Opaque login material for the platform: the cookie set captured after
/// login. The core never looks inside except to hand the session token to
/// the API client and the cookies to the browser.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct Credentials {
    pub cookies: BTreeMap<String, String>,
}

impl Credentials {
    pub const SESSION_COOKIE: &'static str = "session_token";

    pub fn from_session_token(token: &str) -> Self {
        let mut cookies = BTreeMap::new();
        cookies.insert(Self::SESSION_COOKIE.to_string(), token.to_string());
        Self { cookies }
    }

    /// Kick stores the bearer token URL-encoded inside the `session_token` cookie.
    pub fn session_token(&self) -> Option<String> {
        let raw = self.cookies.get(Self::SESSION_COOKIE)?.trim();
        if raw.is_empty() {
            return None;
        }
        let decoded = urlencoding::decode(raw)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| raw.to_string());
        Some(decoded)
    }

    pub fn is_empty(&self) -> bool {
        self.session_token().is_none()
    }
}

// Keep tokens out of logs
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("cookies", &self.cookies.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_token_is_url_decoded() {
        let creds = Credentials::from_session_token("123%7Cabc");
        assert_eq!(creds.session_token().as_deref(), Some("123|abc"));
        assert!(!creds.is_empty());
        assert!(!format!("{:?}", creds).contains("abc"));
    }

    #[test]
    fn test_blank_token_counts_as_empty() {
        let creds = Credentials::from_session_token("   ");
        assert!(creds.is_empty());
        assert!(Credentials::default().is_empty());
    }
}
