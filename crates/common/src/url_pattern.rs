//! Allow-list matching for user-supplied push URLs.
//!
//! Config accepts a list of patterns, each either a literal URL or a regex
//! wrapped in forward slashes. Patterns are anchored with `^`/`$` so a
//! partial match can never admit a URL. Matching ignores the query string
//! and fragment, and tolerates one trailing `/` on the tested URL.

use regex::Regex;
use url::Url;

#[derive(Debug, Clone)]
enum Pattern {
    Literal(String),
    Regex(Regex),
}

#[derive(Debug, Clone)]
pub struct UrlAllowList {
    patterns: Vec<Pattern>,
}

impl UrlAllowList {
    /// Parse configured patterns. Invalid regexes are a configuration error
    /// at load time, never at match time.
    pub fn parse(patterns: impl IntoIterator<Item = impl AsRef<str>>) -> anyhow::Result<Self> {
        let patterns = patterns
            .into_iter()
            .map(|p| {
                let p = p.as_ref();
                match p.strip_prefix('/').and_then(|p| p.strip_suffix('/')) {
                    Some(inner) if !inner.is_empty() => {
                        let anchored = format!("^(?:{inner})$");
                        let regex = Regex::new(&anchored).map_err(|e| {
                            anyhow::anyhow!("Invalid URL pattern regex {p:?}: {e}")
                        })?;
                        Ok(Pattern::Regex(regex))
                    },
                    _ => Ok(Pattern::Literal(normalize(p)?)),
                }
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, url: &str) -> bool {
        let Ok(candidate) = normalize(url) else {
            return false;
        };
        self.patterns.iter().any(|p| match p {
            Pattern::Literal(lit) => *lit == candidate,
            Pattern::Regex(re) => re.is_match(&candidate),
        })
    }
}

/// Strip query/fragment and a trailing slash so equivalent spellings of the
/// same endpoint compare equal.
fn normalize(url: &str) -> anyhow::Result<String> {
    let mut parsed = Url::parse(url).map_err(|e| anyhow::anyhow!("Invalid URL {url:?}: {e}"))?;
    parsed.set_query(None);
    parsed.set_fragment(None);
    let s = parsed.to_string();
    Ok(s.strip_suffix('/').map(str::to_owned).unwrap_or(s))
}

#[cfg(test)]
mod tests {
    use super::UrlAllowList;

    #[test]
    fn test_literal_match_ignores_query_and_trailing_slash() {
        let list = UrlAllowList::parse(["https://api.example.com/push"]).unwrap();
        assert!(list.matches("https://api.example.com/push"));
        assert!(list.matches("https://api.example.com/push/"));
        assert!(list.matches("https://api.example.com/push?schema=zero&appID=a1"));
        assert!(list.matches("https://api.example.com/push#frag"));
        assert!(!list.matches("https://api.example.com/push/v2"));
        assert!(!list.matches("https://evil.example.com/push"));
    }

    #[test]
    fn test_regex_patterns_are_anchored() {
        let list = UrlAllowList::parse([r"/https://[a-z]+\.example\.com/push/"]).unwrap();
        assert!(list.matches("https://api.example.com/push"));
        assert!(list.matches("https://staging.example.com/push/"));
        assert!(!list.matches("https://api.example.com/push/extra"));
        // An unanchored regex would match this prefix-embedded URL.
        assert!(!list.matches("https://evil.com/?u=https://api.example.com/push"));
    }

    #[test]
    fn test_invalid_regex_is_config_error() {
        assert!(UrlAllowList::parse(["/[unclosed/"]).is_err());
    }
}
