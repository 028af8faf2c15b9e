use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use smol_str::SmolStr;
use thiserror::Error;

/// A username that matches the rules for usernames: non-empty, with no
/// whitespace anywhere.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct UserName(SmolStr);

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("username must not contain whitespace or be empty")]
pub struct UserNameError;

impl UserName {
    pub fn parse(username: impl AsRef<str>) -> Result<Self, UserNameError> {
        let username = username.as_ref();
        if username.is_empty() || username.chars().any(char::is_whitespace) {
            return Err(UserNameError);
        }
        Ok(Self(SmolStr::new(username)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for UserName {
    type Err = UserNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for UserName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<SmolStr> for UserName {
    type Error = UserNameError;

    fn try_from(value: SmolStr) -> Result<Self, Self::Error> {
        UserName::parse(value.as_str())
    }
}

impl<'de> Deserialize<'de> for UserName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = SmolStr::deserialize(deserializer)?;
        UserName::try_from(value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::UserName;

    #[test]
    fn username_roundtrip() {
        let username = UserName::parse("alice_01").expect("valid username");
        assert_eq!(username.as_str(), "alice_01");
    }

    #[test]
    fn username_rejects_whitespace_and_empty() {
        assert!(UserName::parse("").is_err());
        assert!(UserName::parse("ab cd").is_err());
        assert!(UserName::parse(" alice").is_err());
        assert!(UserName::parse("alice\t").is_err());
        assert!(UserName::parse("al\nice").is_err());
    }
}
