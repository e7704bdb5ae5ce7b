//! Desired dataplane state, read from YAML.
//!
//! ```yaml
//! interfaces:
//!   - name: tap1
//!     enabled: true
//! bridge_domains:
//!   - name: bd1
//!     interfaces: [tap1, eth0]
//! fib_entries:
//!   - bridge_domain: bd1
//!     mac: "02:00:00:00:00:aa"
//!     outgoing_interface: tap1
//! ```

use crate::descriptors::{bridge_domain, interface, l2_fib, BridgeDomain, FibEntry, Interface};
use crate::error::{AgentError, Result};
use kvscheduler::{value, KeyValuePair};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredState {
    #[serde(default)]
    pub interfaces: Vec<Interface>,
    #[serde(default)]
    pub bridge_domains: Vec<BridgeDomain>,
    #[serde(default)]
    pub fib_entries: Vec<FibEntry>,
}

impl DesiredState {
    pub fn parse(yaml: &str) -> std::result::Result<Self, serde_yaml::Error> {
        // an empty document is an empty configuration
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        Self::parse(&content).map_err(|e| AgentError::Desired {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Key/value pairs for a full resync.
    pub fn to_kvs(&self) -> Vec<KeyValuePair> {
        let interfaces = self
            .interfaces
            .iter()
            .map(|i| KeyValuePair::new(interface::key(&i.name), value(i.clone())));
        let bridge_domains = self
            .bridge_domains
            .iter()
            .map(|bd| KeyValuePair::new(bridge_domain::key(&bd.name), value(bd.clone())));
        let fib_entries = self
            .fib_entries
            .iter()
            .map(|e| KeyValuePair::new(l2_fib::key(&e.bridge_domain, &e.mac), value(e.clone())));
        interfaces.chain(bridge_domains).chain(fib_entries).collect()
    }
}

/// Desired-state file, re-read only when its content changes.
#[derive(Debug)]
pub struct DesiredFile {
    path: PathBuf,
    last_content: Option<String>,
}

impl DesiredFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_content: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the new state if the file changed since the last call.
    ///
    /// A file that fails to parse is reported once and is not retried until
    /// its content changes again.
    pub fn poll(&mut self) -> Result<Option<DesiredState>> {
        let content = fs::read_to_string(&self.path)?;
        if self.last_content.as_deref() == Some(content.as_str()) {
            return Ok(None);
        }
        let parsed = DesiredState::parse(&content);
        self.last_content = Some(content);
        parsed.map(Some).map_err(|e| AgentError::Desired {
            path: self.path.clone(),
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::InterfaceKind;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
interfaces:
  - name: tap1
    enabled: true
  - name: lo1
    kind: loopback
    mtu: 9000
bridge_domains:
  - name: bd1
    flood: false
    interfaces: [tap1]
fib_entries:
  - bridge_domain: bd1
    mac: "02:00:00:00:00:AA"
    outgoing_interface: tap1
"#;

    #[test]
    fn test_parse_with_defaults() {
        let state = DesiredState::parse(SAMPLE).unwrap();
        assert_eq!(state.interfaces.len(), 2);
        assert_eq!(state.interfaces[0].kind, InterfaceKind::Tap);
        assert_eq!(state.interfaces[0].mtu, 1500);
        assert_eq!(state.interfaces[1].kind, InterfaceKind::Loopback);
        assert!(!state.interfaces[1].enabled);
        assert!(state.bridge_domains[0].learn);
        assert!(!state.bridge_domains[0].flood);
    }

    #[test]
    fn test_empty_document() {
        assert_eq!(DesiredState::parse("").unwrap(), DesiredState::default());
        assert_eq!(DesiredState::parse("interfaces: []").unwrap(), DesiredState::default());
    }

    #[test]
    fn test_to_kvs() {
        let keys: Vec<String> = DesiredState::parse(SAMPLE)
            .unwrap()
            .to_kvs()
            .into_iter()
            .map(|kv| kv.key)
            .collect();
        assert_eq!(
            keys,
            vec![
                "config/interfaces/tap1",
                "config/interfaces/lo1",
                "config/bridge-domains/bd1",
                "config/fib/bd1/mac/02:00:00:00:00:aa",
            ]
        );
    }

    #[test]
    fn test_poll_reports_changes_once() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        file.flush().unwrap();

        let mut desired = DesiredFile::new(file.path());
        assert!(desired.poll().unwrap().is_some());
        assert!(desired.poll().unwrap().is_none());

        std::fs::write(file.path(), "interfaces: [{name: tap9}]").unwrap();
        let state = desired.poll().unwrap().unwrap();
        assert_eq!(state.interfaces[0].name, "tap9");
    }

    #[test]
    fn test_poll_malformed_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"interfaces: {oops").unwrap();
        file.flush().unwrap();

        let mut desired = DesiredFile::new(file.path());
        assert!(matches!(desired.poll(), Err(AgentError::Desired { .. })));
        // unchanged content is not parsed again
        assert!(desired.poll().unwrap().is_none());
    }
}
