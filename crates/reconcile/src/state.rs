//! Persistent record of what has been applied.
//!
//! State is a single versioned JSON document mapping resource addresses to
//! the attributes last confirmed by the provider. It is the diff baseline
//! for planning and the only memory the engine has between runs. Saves are
//! atomic (temp file + rename) so an interrupted run leaves the previous
//! consistent document on disk, and the executor funnels every mutation
//! through one `Mutex<StateStore>` so records are persisted action by
//! action.

use crate::addr::Address;
use crate::error::{Result, StateError};
use crate::value::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Highest state document version this build reads and writes.
pub const STATE_VERSION: u32 = 1;

/// One managed resource as last confirmed by the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Provider-assigned external identity
    pub id: String,
    /// Full attribute set, including computed attributes
    pub attrs: BTreeMap<String, Value>,
    /// Addresses this resource depended on when applied; drives
    /// children-before-parents destroy ordering
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Address>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The on-disk document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDocument {
    pub version: u32,
    /// Monotonic save counter
    pub serial: u64,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceRecord>,
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
}

impl StateDocument {
    fn empty() -> Self {
        Self {
            version: STATE_VERSION,
            serial: 0,
            last_updated: Utc::now(),
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }

    pub fn get(&self, addr: &Address) -> Option<&ResourceRecord> {
        self.resources.get(&addr.to_string())
    }
}

/// Loads, mutates, and atomically saves the state document.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    doc: StateDocument,
}

impl StateStore {
    /// Load the document at `path`; a missing file is an empty document.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            log::debug!("state file {} absent, starting empty", path.display());
            return Ok(Self {
                path,
                doc: StateDocument::empty(),
            });
        }

        let raw = fs::read_to_string(&path).map_err(|source| StateError::Read {
            path: path.clone(),
            source,
        })?;
        let doc: StateDocument =
            serde_json::from_str(&raw).map_err(|source| StateError::Corrupt {
                path: path.clone(),
                source,
            })?;
        if doc.version > STATE_VERSION {
            return Err(StateError::UnsupportedVersion {
                path,
                found: doc.version,
                supported: STATE_VERSION,
            }
            .into());
        }
        for address in doc.resources.keys() {
            if Address::parse(address).is_none() {
                return Err(StateError::BadAddress {
                    address: address.clone(),
                }
                .into());
            }
        }
        log::debug!(
            "loaded state {} (serial {}, {} resource(s))",
            path.display(),
            doc.serial,
            doc.resources.len()
        );
        Ok(Self { path, doc })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn document(&self) -> &StateDocument {
        &self.doc
    }

    /// Write the document atomically: serialize, write a temp sibling, rename.
    pub fn save(&mut self) -> Result<()> {
        self.doc.version = STATE_VERSION;
        self.doc.serial += 1;
        self.doc.last_updated = Utc::now();

        let json = serde_json::to_string_pretty(&self.doc).map_err(StateError::Serialize)?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|source| StateError::Write {
                path: self.path.clone(),
                source,
            })?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json).map_err(|source| StateError::Write {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &self.path).map_err(|source| StateError::Write {
            path: self.path.clone(),
            source,
        })?;
        log::trace!("state saved (serial {})", self.doc.serial);
        Ok(())
    }

    /// Record a successful create or update. Keeps the original creation
    /// timestamp when the record already exists.
    pub fn record_applied(
        &mut self,
        addr: &Address,
        id: String,
        attrs: BTreeMap<String, Value>,
        dependencies: Vec<Address>,
    ) {
        let now = Utc::now();
        let created_at = self
            .doc
            .get(addr)
            .map(|record| record.created_at)
            .unwrap_or(now);
        self.doc.resources.insert(
            addr.to_string(),
            ResourceRecord {
                id,
                attrs,
                dependencies,
                created_at,
                updated_at: now,
            },
        );
    }

    /// Drop the record for a successfully destroyed resource.
    pub fn record_destroyed(&mut self, addr: &Address) {
        self.doc.resources.remove(&addr.to_string());
    }

    /// Replace a record's attributes with freshly read remote values.
    pub fn record_refreshed(&mut self, addr: &Address, attrs: BTreeMap<String, Value>) {
        if let Some(record) = self.doc.resources.get_mut(&addr.to_string()) {
            record.attrs = attrs;
            record.updated_at = Utc::now();
        }
    }

    pub fn set_outputs(&mut self, outputs: BTreeMap<String, Value>) {
        self.doc.outputs = outputs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn record(id: &str) -> (String, BTreeMap<String, Value>) {
        let mut attrs = BTreeMap::new();
        attrs.insert("name".to_string(), Value::from("web"));
        attrs.insert("replicas".to_string(), Value::Int(3));
        (id.to_string(), attrs)
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path().join("strata.state.json")).unwrap();
        assert_eq!(store.document().serial, 0);
        assert!(store.document().resources.is_empty());
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strata.state.json");
        let addr = Address::parse("svc.web[0]").unwrap();
        let dep = Address::parse("net.main").unwrap();

        let mut store = StateStore::open(&path).unwrap();
        let (id, attrs) = record("r-1");
        store.record_applied(&addr, id, attrs.clone(), vec![dep.clone()]);
        store.set_outputs([("url".to_string(), Value::from("http://web"))].into());
        store.save().unwrap();

        let reloaded = StateStore::open(&path).unwrap();
        assert_eq!(reloaded.document().serial, 1);
        let loaded = reloaded.document().get(&addr).unwrap();
        assert_eq!(loaded.id, "r-1");
        assert_eq!(loaded.attrs, attrs);
        assert_eq!(loaded.dependencies, vec![dep]);
        assert_eq!(
            reloaded.document().outputs["url"],
            Value::from("http://web")
        );
    }

    #[test]
    fn test_save_increments_serial_and_keeps_created_at() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strata.state.json");
        let addr = Address::parse("svc.web").unwrap();

        let mut store = StateStore::open(&path).unwrap();
        let (id, attrs) = record("r-1");
        store.record_applied(&addr, id, attrs, Vec::new());
        store.save().unwrap();
        let created = store.document().get(&addr).unwrap().created_at;

        let (id, mut attrs) = record("r-1");
        attrs.insert("replicas".to_string(), Value::Int(5));
        store.record_applied(&addr, id, attrs, Vec::new());
        store.save().unwrap();

        let reloaded = StateStore::open(&path).unwrap();
        assert_eq!(reloaded.document().serial, 2);
        let loaded = reloaded.document().get(&addr).unwrap();
        assert_eq!(loaded.created_at, created);
        assert!(loaded.updated_at >= created);
        assert_eq!(loaded.attrs["replicas"], Value::Int(5));
    }

    #[test]
    fn test_destroy_removes_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strata.state.json");
        let addr = Address::parse("svc.web").unwrap();

        let mut store = StateStore::open(&path).unwrap();
        let (id, attrs) = record("r-1");
        store.record_applied(&addr, id, attrs, Vec::new());
        store.record_destroyed(&addr);
        store.save().unwrap();

        let reloaded = StateStore::open(&path).unwrap();
        assert!(reloaded.document().get(&addr).is_none());
    }

    #[test]
    fn test_newer_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strata.state.json");
        fs::write(
            &path,
            r#"{"version": 99, "serial": 1, "last_updated": "2026-01-01T00:00:00Z", "resources": {}, "outputs": {}}"#,
        )
        .unwrap();
        let err = StateStore::open(&path).unwrap_err();
        assert!(matches!(
            err,
            Error::State(StateError::UnsupportedVersion { found: 99, .. })
        ));
    }

    #[test]
    fn test_corrupt_document_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strata.state.json");
        fs::write(&path, "{ not json").unwrap();
        let err = StateStore::open(&path).unwrap_err();
        assert!(matches!(err, Error::State(StateError::Corrupt { .. })));
    }

    #[test]
    fn test_bad_address_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strata.state.json");
        fs::write(
            &path,
            r#"{"version": 1, "serial": 1, "last_updated": "2026-01-01T00:00:00Z",
                "resources": {"not an address": {"id": "r-1", "attrs": {},
                "created_at": "2026-01-01T00:00:00Z", "updated_at": "2026-01-01T00:00:00Z"}},
                "outputs": {}}"#,
        )
        .unwrap();
        let err = StateStore::open(&path).unwrap_err();
        assert!(matches!(err, Error::State(StateError::BadAddress { .. })));
    }

    #[test]
    fn test_failed_save_leaves_previous_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strata.state.json");
        let addr = Address::parse("svc.web").unwrap();

        let mut store = StateStore::open(&path).unwrap();
        let (id, attrs) = record("r-1");
        store.record_applied(&addr, id, attrs, Vec::new());
        store.save().unwrap();

        // An unknown value cannot be serialized; the save must fail before
        // touching the file.
        store.record_applied(
            &addr,
            "r-1".to_string(),
            [("id".to_string(), Value::Unknown)].into(),
            Vec::new(),
        );
        assert!(store.save().is_err());

        let reloaded = StateStore::open(&path).unwrap();
        assert_eq!(reloaded.document().serial, 1);
        assert_eq!(
            reloaded.document().get(&addr).unwrap().attrs["name"],
            Value::from("web")
        );
    }
}
