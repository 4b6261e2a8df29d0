//! Replication domain identifiers

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ChangelogError, ChangelogResult};

/// Normalized base DN naming one replication domain
///
/// Normalization lowercases the DN and strips whitespace around RDN
/// separators, so `"DC=Example, dc=com"` and `"dc=example,dc=com"` name the
/// same domain. `:` and `;` are rejected because they delimit cookies.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BaseDn(String);

impl BaseDn {
    /// Normalize and validate a DN
    pub fn new(dn: &str) -> ChangelogResult<Self> {
        let trimmed = dn.trim();
        if trimmed.is_empty() {
            return Err(ChangelogError::parse("empty base DN"));
        }
        if trimmed.contains(':') || trimmed.contains(';') {
            return Err(ChangelogError::parse(format!(
                "base DN '{}' contains a cookie delimiter",
                dn
            )));
        }

        let mut normalized = String::with_capacity(trimmed.len());
        for (i, rdn) in trimmed.split(',').enumerate() {
            let rdn = rdn.trim();
            let (attr, value) = rdn.split_once('=').ok_or_else(|| {
                ChangelogError::parse(format!("malformed RDN '{}' in '{}'", rdn, dn))
            })?;
            let (attr, value) = (attr.trim(), value.trim());
            if attr.is_empty() || value.is_empty() {
                return Err(ChangelogError::parse(format!(
                    "malformed RDN '{}' in '{}'",
                    rdn, dn
                )));
            }
            if i > 0 {
                normalized.push(',');
            }
            normalized.push_str(&attr.to_ascii_lowercase());
            normalized.push('=');
            normalized.push_str(&value.to_lowercase());
        }
        Ok(BaseDn(normalized))
    }

    /// Normalized string form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BaseDn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BaseDn {
    type Err = ChangelogError;

    fn from_str(s: &str) -> ChangelogResult<Self> {
        BaseDn::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization() {
        let a = BaseDn::new("DC=Example, dc=COM").unwrap();
        let b = BaseDn::new("dc=example,dc=com").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "dc=example,dc=com");
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(BaseDn::new("").is_err());
        assert!(BaseDn::new("   ").is_err());
        assert!(BaseDn::new("example").is_err());
        assert!(BaseDn::new("dc=,dc=com").is_err());
        assert!(BaseDn::new("dc=a:b").is_err());
        assert!(BaseDn::new("dc=a;dc=b").is_err());
    }

    #[test]
    fn test_ordering_is_by_normalized_form() {
        let a = BaseDn::new("o=alpha").unwrap();
        let b = BaseDn::new("O=Beta").unwrap();
        assert!(a < b);
    }
}
