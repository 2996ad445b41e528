use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;

use serde::Serialize;

pub const MAX_UPSTREAM_NAME_LEN: usize = 100;

/// Validated upstream server name: `[A-Za-z0-9_-]{1,100}`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UpstreamName(Box<str>);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamNameError {
    #[error("upstream name must not be empty")]
    Empty,
    #[error("upstream name too long: {0} chars (max {MAX_UPSTREAM_NAME_LEN})")]
    TooLong(usize),
    #[error("invalid upstream name: {0} (allowed: [A-Za-z0-9_-]+)")]
    Invalid(String),
}

impl UpstreamName {
    pub fn parse(name: impl AsRef<str>) -> Result<Self, UpstreamNameError> {
        let name = name.as_ref().trim();
        if name.is_empty() {
            return Err(UpstreamNameError::Empty);
        }
        if name.len() > MAX_UPSTREAM_NAME_LEN {
            return Err(UpstreamNameError::TooLong(name.len()));
        }
        if !name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-'))
        {
            return Err(UpstreamNameError::Invalid(name.to_string()));
        }
        Ok(Self(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The proxy-visible name of `native` on this upstream.
    pub fn qualify(&self, native: &str) -> String {
        format!("{}_{native}", self.0)
    }
}

impl Deref for UpstreamName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl AsRef<str> for UpstreamName {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Borrow<str> for UpstreamName {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for UpstreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

impl Serialize for UpstreamName {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl TryFrom<&str> for UpstreamName {
    type Error = UpstreamNameError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl TryFrom<String> for UpstreamName {
    type Error = UpstreamNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<UpstreamName> for String {
    fn from(value: UpstreamName) -> Self {
        value.0.into()
    }
}

/// A qualified tool name split into its owning upstream and native tool name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualifiedName<'a> {
    pub upstream: &'a UpstreamName,
    pub native: &'a str,
}

impl<'a> QualifiedName<'a> {
    /// Resolve `qualified` against a set of known upstream names.
    ///
    /// Upstream names may themselves contain `_`, so the owning upstream is
    /// the longest registered name that prefixes `qualified` followed by `_`
    /// and a non-empty native name.
    pub fn resolve<I>(qualified: &'a str, upstreams: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a UpstreamName>,
    {
        let mut best: Option<Self> = None;
        for upstream in upstreams {
            let prefix_len = upstream.as_str().len();
            let Some(rest) = qualified.strip_prefix(upstream.as_str()) else {
                continue;
            };
            let Some(native) = rest.strip_prefix('_') else {
                continue;
            };
            if native.is_empty() {
                continue;
            }
            if best
                .as_ref()
                .map_or(true, |b| b.upstream.as_str().len() < prefix_len)
            {
                best = Some(Self { upstream, native });
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_valid_names() {
        for name in ["fs", "my-server", "a_b", "A9", "x".repeat(100).as_str()] {
            assert!(UpstreamName::parse(name).is_ok(), "name={name:?}");
        }
    }

    #[test]
    fn parse_rejects_invalid_names() {
        assert_eq!(UpstreamName::parse(""), Err(UpstreamNameError::Empty));
        assert_eq!(UpstreamName::parse("  "), Err(UpstreamNameError::Empty));
        assert!(matches!(
            UpstreamName::parse("x".repeat(101)),
            Err(UpstreamNameError::TooLong(101))
        ));
        assert!(matches!(
            UpstreamName::parse("has space"),
            Err(UpstreamNameError::Invalid(_))
        ));
        assert!(matches!(
            UpstreamName::parse("dot.dot"),
            Err(UpstreamNameError::Invalid(_))
        ));
    }

    #[test]
    fn qualify_joins_with_underscore() {
        let name = UpstreamName::parse("fs").unwrap();
        assert_eq!(name.qualify("read_file"), "fs_read_file");
    }

    #[test]
    fn resolve_prefers_longest_upstream_prefix() {
        let fs = UpstreamName::parse("fs").unwrap();
        let fs_remote = UpstreamName::parse("fs_remote").unwrap();
        let upstreams = [fs.clone(), fs_remote.clone()];

        let resolved = QualifiedName::resolve("fs_remote_read", upstreams.iter()).unwrap();
        assert_eq!(resolved.upstream, &fs_remote);
        assert_eq!(resolved.native, "read");

        let resolved = QualifiedName::resolve("fs_read_file", upstreams.iter()).unwrap();
        assert_eq!(resolved.upstream, &fs);
        assert_eq!(resolved.native, "read_file");
    }

    #[test]
    fn resolve_rejects_unknown_or_empty_native() {
        let fs = UpstreamName::parse("fs").unwrap();
        let upstreams = [fs];
        assert!(QualifiedName::resolve("web_fetch", upstreams.iter()).is_none());
        assert!(QualifiedName::resolve("fs_", upstreams.iter()).is_none());
        assert!(QualifiedName::resolve("fs", upstreams.iter()).is_none());
    }
}
