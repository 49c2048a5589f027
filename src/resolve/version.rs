use std::cmp::Ordering;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// A library version string with a total, deterministic ordering.
///
/// Versions are split into tokens on `.`, `-` and `_`. Numeric tokens compare
/// numerically and rank above textual ones, textual tokens compare
/// case-insensitively. When one version is a prefix of the other, a trailing
/// number makes the longer one newer (`1.0.1 > 1.0`) while a trailing
/// qualifier makes it older (`1.0-rc1 < 1.0`). Versions that still tie, such
/// as `1.0` and `1.00`, fall back to plain string order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(String);

#[derive(Debug, PartialEq, Eq)]
enum Token<'a> {
    Number(u64),
    Text(&'a str),
}

impl Version {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn tokens(&self) -> impl Iterator<Item = Token<'_>> {
        self.0
            .split(['.', '-', '_'])
            .filter(|part| !part.is_empty())
            .map(|part| match part.parse::<u64>() {
                Ok(n) => Token::Number(n),
                Err(_) => Token::Text(part),
            })
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let mut a = self.tokens();
        let mut b = other.tokens();

        loop {
            let ordering = match (a.next(), b.next()) {
                (None, None) => break,
                (Some(Token::Number(_)), None) => Ordering::Greater,
                (Some(Token::Text(_)), None) => Ordering::Less,
                (None, Some(Token::Number(_))) => Ordering::Less,
                (None, Some(Token::Text(_))) => Ordering::Greater,
                (Some(Token::Number(x)), Some(Token::Number(y))) => x.cmp(&y),
                (Some(Token::Number(_)), Some(Token::Text(_))) => Ordering::Greater,
                (Some(Token::Text(_)), Some(Token::Number(_))) => Ordering::Less,
                (Some(Token::Text(x)), Some(Token::Text(y))) => {
                    x.to_ascii_lowercase().cmp(&y.to_ascii_lowercase())
                }
            };

            if ordering != Ordering::Equal {
                return ordering;
            }
        }

        self.0.cmp(&other.0)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::new(s)
    }

    #[test]
    fn test_numeric_ordering() {
        assert!(v("2.10.1") > v("2.9.0"));
        assert!(v("1.0.1") > v("1.0"));
        assert!(v("10") > v("9"));
    }

    #[test]
    fn test_qualifier_ordering() {
        assert!(v("1.0-rc1") < v("1.0"));
        assert!(v("32.1.3-jre") > v("31.1-jre"));
        assert!(v("1.0-alpha") < v("1.0-beta"));
    }

    #[test]
    fn test_total_order_is_consistent_with_eq() {
        assert_ne!(v("1.0"), v("1.00"));
        assert_ne!(v("1.0").cmp(&v("1.00")), Ordering::Equal);
        assert_eq!(v("1.0").cmp(&v("1.0")), Ordering::Equal);
    }
}
