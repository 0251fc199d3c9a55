//! Entity store interface and the in-memory implementation
//!
//! The store is the source of declared state. Referential rules that must hold
//! atomically (no dangling host references, no deleting a referenced
//! certificate or policy) are enforced here under the store's own lock, so a
//! concurrent mutation can never slip between a check and a write.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ControlError, Result, ValidationError};
use crate::model::{
    AccessPolicy, AccessPolicyId, AppliedConfigRecord, AuthPolicy, AuthPolicyId, Certificate,
    CertificateId, Host, HostId, SecurityRuleSet, SecurityRuleSetId, Snapshot,
};

/// Transactional entity store as seen by the control plane
pub trait Store: Send + Sync {
    /// Consistent copy of all declared state
    fn snapshot(&self) -> Snapshot;

    fn list_hosts(&self) -> Vec<Host>;
    fn get_host(&self, id: HostId) -> Option<Host>;
    /// Insert a new host; fails on dangling references
    fn insert_host(&self, host: Host) -> Result<()>;
    /// Replace an existing host, returning the previous version
    fn replace_host(&self, host: Host) -> Result<Host>;
    fn remove_host(&self, id: HostId) -> Result<Host>;

    fn get_certificate(&self, id: CertificateId) -> Option<Certificate>;
    fn insert_certificate(&self, certificate: Certificate) -> Result<()>;
    /// Fails with `Conflict` while any host references the certificate
    fn remove_certificate(&self, id: CertificateId) -> Result<Certificate>;

    fn get_access_policy(&self, id: AccessPolicyId) -> Option<AccessPolicy>;
    fn insert_access_policy(&self, policy: AccessPolicy) -> Result<()>;
    fn replace_access_policy(&self, policy: AccessPolicy) -> Result<AccessPolicy>;
    /// Fails with `Conflict` while any host references the policy
    fn remove_access_policy(&self, id: AccessPolicyId) -> Result<AccessPolicy>;

    fn get_auth_policy(&self, id: AuthPolicyId) -> Option<AuthPolicy>;
    fn insert_auth_policy(&self, policy: AuthPolicy) -> Result<()>;
    fn remove_auth_policy(&self, id: AuthPolicyId) -> Result<AuthPolicy>;

    fn get_security_rule_set(&self, id: SecurityRuleSetId) -> Option<SecurityRuleSet>;
    fn insert_security_rule_set(&self, rule_set: SecurityRuleSet) -> Result<()>;
    fn remove_security_rule_set(&self, id: SecurityRuleSetId) -> Result<SecurityRuleSet>;

    fn hosts_referencing_certificate(&self, id: CertificateId) -> Vec<HostId>;
    fn hosts_referencing_access_policy(&self, id: AccessPolicyId) -> Vec<HostId>;

    /// Append an audit record. Records are never modified afterwards.
    fn append_applied(&self, record: AppliedConfigRecord) -> Result<()>;
    /// Most recent records first
    fn applied_records(&self, limit: usize) -> Vec<AppliedConfigRecord>;
    fn last_successful_applied(&self) -> Option<AppliedConfigRecord>;
}

/// On-disk layout of the state file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistedState {
    #[serde(flatten)]
    snapshot: Snapshot,
    #[serde(default)]
    applied_records: Vec<AppliedConfigRecord>,
}

/// Store backed by process memory, optionally mirrored to a JSON file
pub struct MemoryStore {
    state: RwLock<PersistedState>,
    path: Option<PathBuf>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(PersistedState::default()),
            path: None,
        }
    }

    /// Seed from an existing snapshot (tests, imports)
    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            state: RwLock::new(PersistedState {
                snapshot,
                applied_records: Vec::new(),
            }),
            path: None,
        }
    }

    /// Open a file-backed store. A missing file starts empty.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| anyhow::anyhow!("Failed to read state file {:?}: {}", path, e))?;
            let state: PersistedState = serde_json::from_str(&content)
                .map_err(|e| anyhow::anyhow!("Failed to parse state file {:?}: {}", path, e))?;
            info!(
                "Loaded {} hosts, {} certificates, {} access policies from {:?}",
                state.snapshot.hosts.len(),
                state.snapshot.certificates.len(),
                state.snapshot.access_policies.len(),
                path
            );
            state
        } else {
            info!("State file {:?} not found, starting empty", path);
            PersistedState::default()
        };

        Ok(Self {
            state: RwLock::new(state),
            path: Some(path),
        })
    }

    /// Run `f` under the write lock. With a state file, `f` works on a copy
    /// that only replaces the live state once it has been persisted.
    fn write<T>(&self, f: impl FnOnce(&mut PersistedState) -> Result<T>) -> Result<T> {
        let mut state = self.state.write();
        let Some(ref path) = self.path else {
            return f(&mut state);
        };
        let mut next = state.clone();
        let out = f(&mut next)?;
        persist(path, &next)?;
        *state = next;
        Ok(out)
    }
}

fn persist(path: &Path, state: &PersistedState) -> Result<()> {
    let json = serde_json::to_vec_pretty(state)
        .map_err(|e| ControlError::Store(format!("serialize state: {}", e)))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)
        .and_then(|_| std::fs::rename(&tmp, path))
        .map_err(|e| ControlError::Store(format!("write {:?}: {}", path, e)))?;
    debug!("State persisted to {:?}", path);
    Ok(())
}

/// Every reference held by `host` must resolve
fn check_references(snapshot: &Snapshot, host: &Host) -> Result<()> {
    let missing = |entity: &'static str, id: String| {
        ControlError::Validation(ValidationError::MissingReference {
            host: host.id.to_string(),
            entity,
            id,
        })
    };
    if let Some(id) = host.certificate_id {
        if !snapshot.certificates.contains_key(&id) {
            return Err(missing("certificate", id.to_string()));
        }
    }
    if let Some(id) = host.access_policy_id {
        if !snapshot.access_policies.contains_key(&id) {
            return Err(missing("access policy", id.to_string()));
        }
    }
    if let Some(id) = host.auth_policy_id {
        if !snapshot.auth_policies.contains_key(&id) {
            return Err(missing("auth policy", id.to_string()));
        }
    }
    Ok(())
}

fn referencing<F>(hosts: &BTreeMap<HostId, Host>, pred: F) -> Vec<HostId>
where
    F: Fn(&Host) -> bool,
{
    hosts.values().filter(|h| pred(h)).map(|h| h.id).collect()
}

fn conflict(entity: &'static str, id: impl ToString, hosts: Vec<HostId>) -> ControlError {
    ControlError::Conflict {
        entity,
        id: id.to_string(),
        referenced_by: hosts.iter().map(ToString::to_string).collect(),
    }
}

fn insert_new<K: Ord + ToString + Copy, V>(
    map: &mut BTreeMap<K, V>,
    entity: &'static str,
    id: K,
    value: V,
) -> Result<()> {
    if map.contains_key(&id) {
        return Err(ControlError::Validation(ValidationError::field(
            "id",
            format!("{} {} already exists", entity, id.to_string()),
        )));
    }
    map.insert(id, value);
    Ok(())
}

impl Store for MemoryStore {
    fn snapshot(&self) -> Snapshot {
        self.state.read().snapshot.clone()
    }

    fn list_hosts(&self) -> Vec<Host> {
        self.state.read().snapshot.hosts.values().cloned().collect()
    }

    fn get_host(&self, id: HostId) -> Option<Host> {
        self.state.read().snapshot.hosts.get(&id).cloned()
    }

    fn insert_host(&self, host: Host) -> Result<()> {
        host.validate()?;
        self.write(|state| {
            check_references(&state.snapshot, &host)?;
            insert_new(&mut state.snapshot.hosts, "host", host.id, host)
        })
    }

    fn replace_host(&self, host: Host) -> Result<Host> {
        host.validate()?;
        self.write(|state| {
            if !state.snapshot.hosts.contains_key(&host.id) {
                return Err(ControlError::not_found("host", host.id));
            }
            check_references(&state.snapshot, &host)?;
            let previous = state.snapshot.hosts.insert(host.id, host);
            previous.ok_or_else(|| ControlError::Store("host vanished during replace".into()))
        })
    }

    fn remove_host(&self, id: HostId) -> Result<Host> {
        self.write(|state| {
            state
                .snapshot
                .hosts
                .remove(&id)
                .ok_or_else(|| ControlError::not_found("host", id))
        })
    }

    fn get_certificate(&self, id: CertificateId) -> Option<Certificate> {
        self.state.read().snapshot.certificates.get(&id).cloned()
    }

    fn insert_certificate(&self, certificate: Certificate) -> Result<()> {
        certificate.validate()?;
        self.write(|state| {
            insert_new(
                &mut state.snapshot.certificates,
                "certificate",
                certificate.id,
                certificate,
            )
        })
    }

    fn remove_certificate(&self, id: CertificateId) -> Result<Certificate> {
        self.write(|state| {
            let users = referencing(&state.snapshot.hosts, |h| h.certificate_id == Some(id));
            if !users.is_empty() {
                return Err(conflict("certificate", id, users));
            }
            state
                .snapshot
                .certificates
                .remove(&id)
                .ok_or_else(|| ControlError::not_found("certificate", id))
        })
    }

    fn get_access_policy(&self, id: AccessPolicyId) -> Option<AccessPolicy> {
        self.state.read().snapshot.access_policies.get(&id).cloned()
    }

    fn insert_access_policy(&self, policy: AccessPolicy) -> Result<()> {
        crate::access::validate_policy(&policy)?;
        self.write(|state| {
            insert_new(
                &mut state.snapshot.access_policies,
                "access policy",
                policy.id,
                policy,
            )
        })
    }

    fn replace_access_policy(&self, policy: AccessPolicy) -> Result<AccessPolicy> {
        crate::access::validate_policy(&policy)?;
        self.write(|state| {
            let id = policy.id;
            match state.snapshot.access_policies.get_mut(&id) {
                Some(slot) => Ok(std::mem::replace(slot, policy)),
                None => Err(ControlError::not_found("access policy", id)),
            }
        })
    }

    fn remove_access_policy(&self, id: AccessPolicyId) -> Result<AccessPolicy> {
        self.write(|state| {
            let users = referencing(&state.snapshot.hosts, |h| h.access_policy_id == Some(id));
            if !users.is_empty() {
                return Err(conflict("access policy", id, users));
            }
            state
                .snapshot
                .access_policies
                .remove(&id)
                .ok_or_else(|| ControlError::not_found("access policy", id))
        })
    }

    fn get_auth_policy(&self, id: AuthPolicyId) -> Option<AuthPolicy> {
        self.state.read().snapshot.auth_policies.get(&id).cloned()
    }

    fn insert_auth_policy(&self, policy: AuthPolicy) -> Result<()> {
        self.write(|state| {
            insert_new(&mut state.snapshot.auth_policies, "auth policy", policy.id, policy)
        })
    }

    fn remove_auth_policy(&self, id: AuthPolicyId) -> Result<AuthPolicy> {
        self.write(|state| {
            let users = referencing(&state.snapshot.hosts, |h| h.auth_policy_id == Some(id));
            if !users.is_empty() {
                return Err(conflict("auth policy", id, users));
            }
            state
                .snapshot
                .auth_policies
                .remove(&id)
                .ok_or_else(|| ControlError::not_found("auth policy", id))
        })
    }

    fn get_security_rule_set(&self, id: SecurityRuleSetId) -> Option<SecurityRuleSet> {
        self.state.read().snapshot.security_rule_sets.get(&id).cloned()
    }

    fn insert_security_rule_set(&self, rule_set: SecurityRuleSet) -> Result<()> {
        self.write(|state| {
            insert_new(
                &mut state.snapshot.security_rule_sets,
                "security rule set",
                rule_set.id,
                rule_set,
            )
        })
    }

    fn remove_security_rule_set(&self, id: SecurityRuleSetId) -> Result<SecurityRuleSet> {
        self.write(|state| {
            state
                .snapshot
                .security_rule_sets
                .remove(&id)
                .ok_or_else(|| ControlError::not_found("security rule set", id))
        })
    }

    fn hosts_referencing_certificate(&self, id: CertificateId) -> Vec<HostId> {
        referencing(&self.state.read().snapshot.hosts, |h| h.certificate_id == Some(id))
    }

    fn hosts_referencing_access_policy(&self, id: AccessPolicyId) -> Vec<HostId> {
        referencing(&self.state.read().snapshot.hosts, |h| h.access_policy_id == Some(id))
    }

    fn append_applied(&self, record: AppliedConfigRecord) -> Result<()> {
        self.write(|state| {
            state.applied_records.push(record);
            Ok(())
        })
    }

    fn applied_records(&self, limit: usize) -> Vec<AppliedConfigRecord> {
        self.state
            .read()
            .applied_records
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    fn last_successful_applied(&self) -> Option<AppliedConfigRecord> {
        self.state
            .read()
            .applied_records
            .iter()
            .rev()
            .find(|r| r.success)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HostSpec, PolicyKind};
    use chrono::Utc;

    fn host() -> Host {
        Host::from_spec(HostSpec::new("example.com", "10.0.0.2", 8080)).unwrap()
    }

    #[test]
    fn test_insert_host_rejects_dangling_reference() {
        let store = MemoryStore::new();
        let mut h = host();
        h.access_policy_id = Some(AccessPolicyId::new());
        assert!(matches!(
            store.insert_host(h),
            Err(ControlError::Validation(ValidationError::MissingReference { .. }))
        ));
        assert!(store.list_hosts().is_empty());
    }

    #[test]
    fn test_remove_referenced_policy_is_conflict() {
        let store = MemoryStore::new();
        let policy = AccessPolicy::new("office", PolicyKind::Whitelist);
        store.insert_access_policy(policy.clone()).unwrap();

        let mut h = host();
        h.access_policy_id = Some(policy.id);
        store.insert_host(h.clone()).unwrap();

        match store.remove_access_policy(policy.id) {
            Err(ControlError::Conflict { referenced_by, .. }) => {
                assert_eq!(referenced_by, vec![h.id.to_string()]);
            }
            other => panic!("expected conflict, got {:?}", other),
        }
        assert!(store.get_access_policy(policy.id).is_some());

        store.remove_host(h.id).unwrap();
        assert!(store.remove_access_policy(policy.id).is_ok());
    }

    #[test]
    fn test_replace_host_returns_previous() {
        let store = MemoryStore::new();
        let h = host();
        store.insert_host(h.clone()).unwrap();

        let mut updated = h.clone();
        updated.websocket = true;
        let previous = store.replace_host(updated.clone()).unwrap();
        assert_eq!(previous, h);
        assert_eq!(store.get_host(h.id), Some(updated));
    }

    #[test]
    fn test_applied_records_newest_first() {
        let store = MemoryStore::new();
        for (hash, success) in [("a", true), ("b", false), ("c", true), ("d", false)] {
            store
                .append_applied(AppliedConfigRecord {
                    content_hash: hash.to_string(),
                    applied_at: Utc::now(),
                    success,
                    error_message: None,
                })
                .unwrap();
        }
        let recent: Vec<_> = store
            .applied_records(2)
            .into_iter()
            .map(|r| r.content_hash)
            .collect();
        assert_eq!(recent, vec!["d", "c"]);
        assert_eq!(store.last_successful_applied().unwrap().content_hash, "c");
    }

    #[test]
    fn test_file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let h = host();
        {
            let store = MemoryStore::open(&path).unwrap();
            store.insert_host(h.clone()).unwrap();
        }
        let reopened = MemoryStore::open(&path).unwrap();
        assert_eq!(reopened.get_host(h.id), Some(h));
    }

    #[test]
    fn test_failed_persist_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("sub");
        std::fs::create_dir(&state_dir).unwrap();
        let store = MemoryStore::open(state_dir.join("state.json")).unwrap();
        let kept = host();
        store.insert_host(kept.clone()).unwrap();

        std::fs::remove_dir_all(&state_dir).unwrap();
        let lost = host();
        assert!(matches!(
            store.insert_host(lost.clone()),
            Err(ControlError::Store(_))
        ));
        assert!(store.get_host(lost.id).is_none());
        assert!(matches!(store.remove_host(kept.id), Err(ControlError::Store(_))));
        assert_eq!(store.get_host(kept.id), Some(kept));
    }
}
