//! Hierarchical coordination-service paths.

use std::{fmt, str::FromStr, sync::Arc};

use crate::error::{CoordinationError, CoordinationResult};

/// A validated path into the coordination namespace, e.g. `/config/limit`.
///
/// Identity is exact string equality. Cloning is cheap.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathKey(Arc<str>);

impl PathKey {
    /// Validate `path` and wrap it.
    ///
    /// Paths start with `/`, have no trailing `/`, no empty segments and only
    /// `[A-Za-z0-9_=.-]` inside segments. The bare root is rejected because
    /// it cannot hold a value.
    pub fn new(path: impl AsRef<str>) -> CoordinationResult<Self> {
        let path = path.as_ref();
        let invalid = |reason| CoordinationError::InvalidPath {
            path: path.to_owned(),
            reason,
        };

        let Some(rest) = path.strip_prefix('/') else {
            return Err(invalid("must start with '/'"));
        };
        if rest.is_empty() {
            return Err(invalid("the root path cannot hold a value"));
        }
        for segment in rest.split('/') {
            if segment.is_empty() {
                return Err(invalid("empty segment"));
            }
            if !segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '=' | '.' | '-'))
            {
                return Err(invalid("segments may only contain [A-Za-z0-9_=.-]"));
            }
        }
        Ok(Self(Arc::from(path)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key used in a JetStream KV bucket: the path without its leading `/`.
    pub fn kv_key(&self) -> &str {
        &self.0[1..]
    }

    /// Inverse of [`PathKey::kv_key`].
    pub fn from_kv_key(key: &str) -> CoordinationResult<Self> {
        Self::new(format!("/{key}"))
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PathKey {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for PathKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_paths() {
        let path = PathKey::new("/config/limit").unwrap();
        assert_eq!(path.as_str(), "/config/limit");
        assert_eq!(path.kv_key(), "config/limit");
        assert_eq!(path.to_string(), "/config/limit");
        assert_eq!(PathKey::from_kv_key("config/limit").unwrap(), path);
        assert!(PathKey::new("/sms/phoneProvider").is_ok());
        assert!(PathKey::new("/a.b/c-d/e_f=1").is_ok());
    }

    #[test]
    fn test_invalid_paths() {
        for bad in ["", "/", "config/limit", "/config/", "/config//limit", "/a b", "/a/*"] {
            assert!(
                matches!(
                    PathKey::new(bad),
                    Err(CoordinationError::InvalidPath { .. })
                ),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_identity_is_exact() {
        let a: PathKey = "/member".parse().unwrap();
        let b = PathKey::new("/member").unwrap();
        let c = PathKey::new("/Member").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
