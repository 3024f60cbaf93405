use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Sanitized session identifier.
///
/// Every character outside `[A-Za-z0-9_-]` is replaced with `_`, so the key is
/// safe to embed in file paths and sanitizing twice changes nothing.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn sanitize(raw: &str) -> Self {
        Self(
            raw.chars()
                .map(|ch| {
                    if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
                        ch
                    } else {
                        '_'
                    }
                })
                .collect(),
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SessionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionKey {
    fn from(raw: &str) -> Self {
        Self::sanitize(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::SessionKey;

    #[test]
    fn disallowed_characters_become_underscores() {
        assert_eq!(SessionKey::sanitize("../etc/passwd").as_str(), "___etc_passwd");
        assert_eq!(SessionKey::sanitize("user@example.com").as_str(), "user_example_com");
        assert_eq!(SessionKey::sanitize("ok-key_1").as_str(), "ok-key_1");
    }

    #[test]
    fn multibyte_characters_collapse_to_one_underscore_each() {
        assert_eq!(SessionKey::sanitize("café").as_str(), "caf_");
    }

    #[test]
    fn sanitizing_is_idempotent() {
        let once = SessionKey::sanitize("a b/c:d");
        let twice = SessionKey::sanitize(once.as_str());
        assert_eq!(once, twice);
    }
}
