//! Shared types for contentsync

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Returns the current time as a [`Timestamp`].
pub fn now_millis() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Longest accepted locale tag.
const MAX_LOCALE_LEN: usize = 16;

/// Error type for locale parsing failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LocaleError {
    #[error("locale cannot be empty")]
    Empty,
    #[error("locale is longer than 16 characters")]
    TooLong,
    #[error("invalid character in locale: {0}")]
    InvalidCharacter(char),
    #[error("locale cannot start with '{0}'")]
    InvalidStart(char),
    #[error("locale cannot end with '{0}'")]
    InvalidEnd(char),
}

/// A content locale such as `en`, `fr` or `pt-BR`.
///
/// Validation rules:
/// - Non-empty, at most 16 characters
/// - ASCII alphanumerics, hyphens and underscores only
/// - Cannot start or end with a hyphen or underscore
///
/// Locales end up in file names (`tags.<locale>.yml`) and revalidation
/// paths, so anything that could act as a path separator is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Locale(String);

impl Locale {
    /// Returns the locale tag as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Locale {
    type Err = LocaleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(LocaleError::Empty);
        }

        if s.len() > MAX_LOCALE_LEN {
            return Err(LocaleError::TooLong);
        }

        if let Some(c) = s.chars().next().filter(|c| *c == '-' || *c == '_') {
            return Err(LocaleError::InvalidStart(c));
        }

        if let Some(c) = s.chars().last().filter(|c| *c == '-' || *c == '_') {
            return Err(LocaleError::InvalidEnd(c));
        }

        for c in s.chars() {
            if !c.is_ascii_alphanumeric() && c != '-' && c != '_' {
                return Err(LocaleError::InvalidCharacter(c));
            }
        }

        Ok(Locale(s.to_string()))
    }
}

impl Default for Locale {
    /// `en`
    fn default() -> Self {
        Locale("en".to_string())
    }
}

impl TryFrom<String> for Locale {
    type Error = LocaleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Locale> for String {
    fn from(locale: Locale) -> Self {
        locale.0
    }
}

impl fmt::Display for Locale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a sync was requested. Used for logging and the history log only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncReason {
    /// Fired by the periodic scheduler.
    Scheduled,
    /// Requested explicitly (admin action, external cron, CLI).
    Forced,
}

impl SyncReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Forced => "forced",
        }
    }
}

impl FromStr for SyncReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "forced" => Ok(Self::Forced),
            other => Err(format!("unknown sync reason: {}", other)),
        }
    }
}

impl fmt::Display for SyncReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod locale_tests {
        use super::*;

        #[test]
        fn valid_locale_simple() {
            let locale: Locale = "en".parse().unwrap();
            assert_eq!(locale.as_str(), "en");
        }

        #[test]
        fn valid_locale_with_region() {
            let locale: Locale = "pt-BR".parse().unwrap();
            assert_eq!(locale.as_str(), "pt-BR");

            let locale: Locale = "zh_Hant".parse().unwrap();
            assert_eq!(locale.as_str(), "zh_Hant");
        }

        #[test]
        fn invalid_locale_empty() {
            assert_eq!("".parse::<Locale>(), Err(LocaleError::Empty));
        }

        #[test]
        fn invalid_locale_too_long() {
            assert_eq!(
                "abcdefghijklmnopq".parse::<Locale>(),
                Err(LocaleError::TooLong)
            );
        }

        #[test]
        fn invalid_locale_leading_separator() {
            assert_eq!("-en".parse::<Locale>(), Err(LocaleError::InvalidStart('-')));
            assert_eq!("_en".parse::<Locale>(), Err(LocaleError::InvalidStart('_')));
        }

        #[test]
        fn invalid_locale_trailing_separator() {
            assert_eq!("en-".parse::<Locale>(), Err(LocaleError::InvalidEnd('-')));
        }

        #[test]
        fn invalid_locale_path_characters() {
            assert_eq!(
                "en/../fr".parse::<Locale>(),
                Err(LocaleError::InvalidCharacter('/'))
            );
            assert_eq!(
                "e.n".parse::<Locale>(),
                Err(LocaleError::InvalidCharacter('.'))
            );
        }

        #[test]
        fn locale_serde_validates() {
            let locale: Locale = serde_json::from_str("\"fr\"").unwrap();
            assert_eq!(locale.as_str(), "fr");
            assert_eq!(serde_json::to_string(&locale).unwrap(), "\"fr\"");

            let bad = serde_json::from_str::<Locale>("\"../etc\"");
            assert!(bad.is_err());
        }
    }

    #[test]
    fn sync_reason_roundtrips_through_str() {
        for reason in [SyncReason::Scheduled, SyncReason::Forced] {
            assert_eq!(reason.as_str().parse::<SyncReason>(), Ok(reason));
        }
        assert!("cron".parse::<SyncReason>().is_err());
    }

    #[test]
    fn now_millis_is_monotonic_enough() {
        let a = now_millis();
        let b = now_millis();
        assert!(b >= a);
        assert!(a > 1_600_000_000_000);
    }
}
