//! Connection target normalization
//!
//! Shards are unique by connection target, so two spellings of the same
//! replica set (`cfg/b:1,a:1` vs `cfg/a:1, b:1`) must compare equal.

use crate::common::{Error, Result};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionTarget {
    set_name: Option<String>,
    hosts: Vec<String>,
}

impl ConnectionTarget {
    /// Parse `set/host:port,host:port` or a bare `host:port,...` list.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::InvalidArgument("connection target is empty".into()));
        }

        let (set_name, host_list) = match raw.split_once('/') {
            Some((set, hosts)) => {
                let set = set.trim();
                if set.is_empty() {
                    return Err(Error::InvalidArgument(format!(
                        "missing replica set name in {}",
                        raw
                    )));
                }
                (Some(set.to_string()), hosts)
            }
            None => (None, raw),
        };

        let mut hosts: Vec<String> = host_list
            .split(',')
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        if hosts.is_empty() {
            return Err(Error::InvalidArgument(format!("no hosts in {}", raw)));
        }
        if let Some(bad) = hosts.iter().find(|h| h.contains('/') || h.contains(' ')) {
            return Err(Error::InvalidArgument(format!("invalid host {:?}", bad)));
        }
        hosts.sort();
        hosts.dedup();

        Ok(Self { set_name, hosts })
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(set) = &self.set_name {
            write!(f, "{}/", set)?;
        }
        write!(f, "{}", self.hosts.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalizes_host_order() {
        let a = ConnectionTarget::parse("cfg/b:1, a:1").unwrap();
        let b = ConnectionTarget::parse(" cfg/a:1,b:1,a:1 ").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "cfg/a:1,b:1");
    }

    #[test]
    fn test_bare_host_list() {
        let t = ConnectionTarget::parse("Shard-Host:27018").unwrap();
        assert_eq!(t.to_string(), "shard-host:27018");
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(ConnectionTarget::parse("").is_err());
        assert!(ConnectionTarget::parse("cfg/").is_err());
        assert!(ConnectionTarget::parse("/a:1").is_err());
        assert!(ConnectionTarget::parse("cfg/a:1/b").is_err());
    }
}
