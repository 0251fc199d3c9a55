//! Mutation orchestration
//!
//! Every write runs as a small saga:
//!
//! ```text
//! Proposed -> Persisted -> Synthesized -> Applied
//!                               \-> ApplyFailed -> RolledBack
//!                                              \-> RollbackFailed
//! ```
//!
//! One process-wide apply lock is held from the moment the mutation reads the
//! current entity until it is applied or reversed. Inside it the mutation is
//! persisted, the snapshot synthesized and applied. If the apply fails (after
//! `apply_attempts` tries) the mutation is reversed before the lock is
//! released, so no other mutation can build on the failed state and no
//! compensation can overwrite a change it did not make.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::access::{self, AccessDecision};
use crate::applier::{Applier, ApplyOutcome, DriftStatus};
use crate::audit_logger::{AuditEvent, AuditLogger};
use crate::backup::BackupWriter;
use crate::config::EngineConfig;
use crate::engine::ProxyEngine;
use crate::error::{ControlError, Result};
use crate::geo::GeoResolver;
use crate::model::{
    AccessPolicy, AccessPolicyId, AppliedConfigRecord, AuthPolicy, AuthPolicyId, Certificate,
    CertificateId, Host, HostId, HostPatch, HostSpec, SecurityRuleSet, SecurityRuleSetId,
};
use crate::store::Store;
use crate::synth::synthesize;

/// Lifecycle of one mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    Proposed,
    Persisted,
    Synthesized,
    Applied,
    ApplyFailed,
    RolledBack,
    RollbackFailed,
}

impl fmt::Display for MutationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Proposed => "proposed",
            Self::Persisted => "persisted",
            Self::Synthesized => "synthesized",
            Self::Applied => "applied",
            Self::ApplyFailed => "apply_failed",
            Self::RolledBack => "rolled_back",
            Self::RollbackFailed => "rollback_failed",
        };
        f.write_str(s)
    }
}

/// Reverses one persisted mutation
type Compensation = Box<dyn FnOnce(&dyn Store) -> Result<()> + Send>;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DeleteHostOptions {
    /// Also delete the Host's Certificate and AccessPolicy when nothing else uses them
    #[serde(default)]
    pub also_delete_dependents: bool,
}

/// Per-host failure inside a bulk operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostFailure {
    pub host_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkRebindReport {
    pub updated: usize,
    pub errors: Vec<HostFailure>,
}

/// Retry policy for the apply step
#[derive(Debug, Clone, Copy)]
pub struct ApplyPolicy {
    pub attempts: u32,
    pub retry_delay: Duration,
}

impl Default for ApplyPolicy {
    fn default() -> Self {
        Self {
            attempts: 1,
            retry_delay: Duration::from_millis(0),
        }
    }
}

impl From<&EngineConfig> for ApplyPolicy {
    fn from(config: &EngineConfig) -> Self {
        Self {
            attempts: config.apply_attempts.max(1),
            retry_delay: config.retry_delay(),
        }
    }
}

/// The control plane: entity store, synthesizer and applier behind one API
pub struct ControlPlane {
    store: Arc<dyn Store>,
    applier: Applier,
    geo: Arc<dyn GeoResolver>,
    backup: BackupWriter,
    audit: Arc<AuditLogger>,
    policy: ArcSwap<ApplyPolicy>,
    /// Serializes synthesize + apply process-wide
    apply_lock: Mutex<()>,
}

impl ControlPlane {
    pub fn new(
        store: Arc<dyn Store>,
        engine: Arc<dyn ProxyEngine>,
        geo: Arc<dyn GeoResolver>,
        backup: BackupWriter,
        audit: Arc<AuditLogger>,
        policy: ApplyPolicy,
    ) -> Self {
        let applier = Applier::new(engine, store.clone(), audit.clone());
        Self {
            store,
            applier,
            geo,
            backup,
            audit,
            policy: ArcSwap::from_pointee(policy),
            apply_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn applier(&self) -> &Applier {
        &self.applier
    }

    /// Takes effect from the next apply; one already retrying keeps its policy
    pub fn set_apply_policy(&self, policy: ApplyPolicy) {
        info!(
            attempts = policy.attempts,
            retry_delay_ms = policy.retry_delay.as_millis() as u64,
            "Apply policy updated"
        );
        self.policy.store(Arc::new(policy));
    }

    // Hosts

    pub fn list_hosts(&self) -> Vec<Host> {
        self.store.list_hosts()
    }

    pub fn get_host(&self, id: HostId) -> Result<Host> {
        self.store
            .get_host(id)
            .ok_or_else(|| ControlError::not_found("host", id))
    }

    pub async fn create_host(&self, spec: HostSpec) -> Result<Host> {
        let host = Host::from_spec(spec)?;
        let id = host.id;
        let mutation = format!("create host {}", id);
        transition(&mutation, MutationState::Proposed);

        let lock = self.apply_lock.lock().await;
        self.store.insert_host(host.clone())?;
        self.sync(
            &lock,
            mutation,
            Box::new(move |store: &dyn Store| store.remove_host(id).map(drop)),
        )
        .await?;
        Ok(host)
    }

    /// Only fields present in `patch` change
    pub async fn update_host(&self, id: HostId, patch: HostPatch) -> Result<Host> {
        let lock = self.apply_lock.lock().await;
        let updated = self.get_host(id)?.patched(patch)?;
        self.replace_host(&lock, updated, format!("update host {}", id))
            .await
    }

    pub async fn revert_advanced_config(&self, id: HostId) -> Result<Host> {
        let lock = self.apply_lock.lock().await;
        let reverted = self.get_host(id)?.reverted()?;
        self.replace_host(&lock, reverted, format!("revert advanced config of host {}", id))
            .await
    }

    async fn replace_host(
        &self,
        lock: &MutexGuard<'_, ()>,
        host: Host,
        mutation: String,
    ) -> Result<Host> {
        transition(&mutation, MutationState::Proposed);
        let previous = self.store.replace_host(host.clone())?;
        self.sync(
            lock,
            mutation,
            Box::new(move |store: &dyn Store| store.replace_host(previous).map(drop)),
        )
        .await?;
        Ok(host)
    }

    pub async fn delete_host(&self, id: HostId, options: DeleteHostOptions) -> Result<()> {
        let lock = self.apply_lock.lock().await;
        let host = self.get_host(id)?;
        let mutation = format!("delete host {}", id);
        transition(&mutation, MutationState::Proposed);

        if options.also_delete_dependents && host.certificate_id.is_some() {
            self.write_backup(&format!("delete-host-{}", id))?;
        }

        let host = self.store.remove_host(id)?;
        let mut removed_certificate = None;
        let mut removed_policy = None;

        if options.also_delete_dependents {
            if let Some(cert_id) = host.certificate_id {
                match self.store.remove_certificate(cert_id) {
                    Ok(cert) => removed_certificate = Some(cert),
                    Err(e) => info!("Keeping certificate {}: {}", cert_id, e),
                }
            }
            if let Some(policy_id) = host.access_policy_id {
                match self.store.remove_access_policy(policy_id) {
                    Ok(policy) => removed_policy = Some(policy),
                    Err(e) => info!("Keeping access policy {}: {}", policy_id, e),
                }
            }
        }

        let deleted: Vec<(&'static str, String)> = std::iter::once(("host", id.to_string()))
            .chain(removed_certificate.as_ref().map(|c| ("certificate", c.id.to_string())))
            .chain(removed_policy.as_ref().map(|p| ("access policy", p.id.to_string())))
            .collect();

        self.sync(
            &lock,
            mutation,
            Box::new(move |store: &dyn Store| {
                if let Some(cert) = removed_certificate {
                    store.insert_certificate(cert)?;
                }
                if let Some(policy) = removed_policy {
                    store.insert_access_policy(policy)?;
                }
                store.insert_host(host)
            }),
        )
        .await?;

        for (entity, id) in deleted {
            self.audit_deleted(entity, id);
        }
        Ok(())
    }

    /// Point every listed Host at `policy_id` (or detach with None).
    ///
    /// All hosts are persisted first, then the batch is applied once. A failed
    /// apply restores every host that was changed.
    pub async fn bulk_rebind_access_policy(
        &self,
        host_ids: &[HostId],
        policy_id: Option<AccessPolicyId>,
    ) -> Result<BulkRebindReport> {
        let lock = self.apply_lock.lock().await;
        if let Some(pid) = policy_id {
            if self.store.get_access_policy(pid).is_none() {
                return Err(ControlError::not_found("access policy", pid));
            }
        }

        let mutation = match policy_id {
            Some(pid) => format!("rebind {} host(s) to access policy {}", host_ids.len(), pid),
            None => format!("detach access policy from {} host(s)", host_ids.len()),
        };
        transition(&mutation, MutationState::Proposed);

        let mut report = BulkRebindReport::default();
        let mut previous: Vec<Host> = Vec::new();
        for &id in host_ids {
            let result = self.get_host(id).and_then(|current| {
                if current.access_policy_id == policy_id {
                    return Ok(None);
                }
                let mut updated = current;
                updated.access_policy_id = policy_id;
                self.store.replace_host(updated).map(Some)
            });
            match result {
                Ok(Some(old)) => previous.push(old),
                Ok(None) => {}
                Err(e) => report.errors.push(HostFailure {
                    host_id: id.to_string(),
                    error: e.to_string(),
                }),
            }
        }

        if previous.is_empty() {
            return Ok(report);
        }
        let updated = previous.len();

        self.sync(
            &lock,
            mutation,
            Box::new(move |store: &dyn Store| {
                let failures: Vec<String> = previous
                    .into_iter()
                    .filter_map(|host| {
                        let id = host.id;
                        store.replace_host(host).err().map(|e| format!("{}: {}", id, e))
                    })
                    .collect();
                if failures.is_empty() {
                    Ok(())
                } else {
                    Err(ControlError::Store(failures.join("; ")))
                }
            }),
        )
        .await?;

        report.updated = updated;
        Ok(report)
    }

    // Access policies

    pub fn test_access_policy(&self, id: AccessPolicyId, address: &str) -> Result<AccessDecision> {
        let policy = self
            .store
            .get_access_policy(id)
            .ok_or_else(|| ControlError::not_found("access policy", id))?;
        Ok(access::decide(&policy, address, self.geo.as_ref())?)
    }

    pub async fn create_access_policy(&self, mut policy: AccessPolicy) -> Result<AccessPolicy> {
        policy.id = AccessPolicyId::new();
        let id = policy.id;
        let mutation = format!("create access policy {}", id);
        transition(&mutation, MutationState::Proposed);

        let lock = self.apply_lock.lock().await;
        self.store.insert_access_policy(policy.clone())?;
        self.sync(
            &lock,
            mutation,
            Box::new(move |store: &dyn Store| store.remove_access_policy(id).map(drop)),
        )
        .await?;
        Ok(policy)
    }

    pub async fn update_access_policy(
        &self,
        id: AccessPolicyId,
        mut policy: AccessPolicy,
    ) -> Result<AccessPolicy> {
        policy.id = id;
        let mutation = format!("update access policy {}", id);
        transition(&mutation, MutationState::Proposed);

        let lock = self.apply_lock.lock().await;
        let previous = self.store.replace_access_policy(policy.clone())?;
        self.sync(
            &lock,
            mutation,
            Box::new(move |store: &dyn Store| store.replace_access_policy(previous).map(drop)),
        )
        .await?;
        Ok(policy)
    }

    /// Refused with `Conflict` while any Host references the policy
    pub async fn delete_access_policy(&self, id: AccessPolicyId) -> Result<()> {
        let mutation = format!("delete access policy {}", id);
        transition(&mutation, MutationState::Proposed);

        let lock = self.apply_lock.lock().await;
        let policy = self.store.remove_access_policy(id)?;
        self.sync(
            &lock,
            mutation,
            Box::new(move |store: &dyn Store| store.insert_access_policy(policy)),
        )
        .await?;
        self.audit_deleted("access policy", id.to_string());
        Ok(())
    }

    // Certificates

    pub async fn create_certificate(&self, mut certificate: Certificate) -> Result<Certificate> {
        certificate.id = CertificateId::new();
        let id = certificate.id;
        let mutation = format!("create certificate {}", id);
        transition(&mutation, MutationState::Proposed);

        let lock = self.apply_lock.lock().await;
        self.store.insert_certificate(certificate.clone())?;
        self.sync(
            &lock,
            mutation,
            Box::new(move |store: &dyn Store| store.remove_certificate(id).map(drop)),
        )
        .await?;
        Ok(certificate)
    }

    /// Refused with `Conflict` while referenced. A full backup is written first
    /// and a failed backup aborts the delete.
    pub async fn delete_certificate(&self, id: CertificateId) -> Result<()> {
        let lock = self.apply_lock.lock().await;
        if self.store.get_certificate(id).is_none() {
            return Err(ControlError::not_found("certificate", id));
        }
        let users = self.store.hosts_referencing_certificate(id);
        if !users.is_empty() {
            return Err(ControlError::Conflict {
                entity: "certificate",
                id: id.to_string(),
                referenced_by: users.iter().map(ToString::to_string).collect(),
            });
        }

        let mutation = format!("delete certificate {}", id);
        transition(&mutation, MutationState::Proposed);
        self.write_backup(&format!("delete-certificate-{}", id))?;

        let certificate = self.store.remove_certificate(id)?;
        self.sync(
            &lock,
            mutation,
            Box::new(move |store: &dyn Store| store.insert_certificate(certificate)),
        )
        .await?;
        self.audit_deleted("certificate", id.to_string());
        Ok(())
    }

    // Auth policies and security rule sets

    pub async fn create_auth_policy(&self, mut policy: AuthPolicy) -> Result<AuthPolicy> {
        policy.id = AuthPolicyId::new();
        let id = policy.id;
        let mutation = format!("create auth policy {}", id);
        transition(&mutation, MutationState::Proposed);

        let lock = self.apply_lock.lock().await;
        self.store.insert_auth_policy(policy.clone())?;
        self.sync(
            &lock,
            mutation,
            Box::new(move |store: &dyn Store| store.remove_auth_policy(id).map(drop)),
        )
        .await?;
        Ok(policy)
    }

    pub async fn create_security_rule_set(
        &self,
        mut rule_set: SecurityRuleSet,
    ) -> Result<SecurityRuleSet> {
        rule_set.id = SecurityRuleSetId::new();
        let id = rule_set.id;
        let mutation = format!("create security rule set {}", id);
        transition(&mutation, MutationState::Proposed);

        let lock = self.apply_lock.lock().await;
        self.store.insert_security_rule_set(rule_set.clone())?;
        self.sync(
            &lock,
            mutation,
            Box::new(move |store: &dyn Store| store.remove_security_rule_set(id).map(drop)),
        )
        .await?;
        Ok(rule_set)
    }

    pub async fn delete_security_rule_set(&self, id: SecurityRuleSetId) -> Result<()> {
        let mutation = format!("delete security rule set {}", id);
        transition(&mutation, MutationState::Proposed);

        let lock = self.apply_lock.lock().await;
        let rule_set = self.store.remove_security_rule_set(id)?;
        self.sync(
            &lock,
            mutation,
            Box::new(move |store: &dyn Store| store.insert_security_rule_set(rule_set)),
        )
        .await?;
        self.audit_deleted("security rule set", id.to_string());
        Ok(())
    }

    // Applied state

    /// Re-apply the current declared state, even if its hash is already live
    pub async fn reconcile(&self) -> Result<ApplyOutcome> {
        let _guard = self.apply_lock.lock().await;
        let doc = synthesize(&self.store.snapshot())?;
        info!(hash = %doc.hash, "Reconciling proxy with declared state");
        Ok(self.applier.force_apply(&doc).await?)
    }

    pub fn drift_status(&self) -> Result<DriftStatus> {
        let doc = synthesize(&self.store.snapshot())?;
        Ok(self.applier.drift(&doc))
    }

    pub fn applied_records(&self, limit: usize) -> Vec<AppliedConfigRecord> {
        self.store.applied_records(limit)
    }

    /// Synthesize and apply the current snapshot, running `compensate` if that
    /// fails. The caller holds the apply lock from before it read the entity.
    async fn sync(
        &self,
        _lock: &MutexGuard<'_, ()>,
        mutation: String,
        compensate: Compensation,
    ) -> Result<ApplyOutcome> {
        transition(&mutation, MutationState::Persisted);

        let doc = match synthesize(&self.store.snapshot()) {
            Ok(doc) => doc,
            Err(e) => {
                let cause = ControlError::Validation(e);
                return Err(self.compensate(&mutation, compensate, cause));
            }
        };
        transition(&mutation, MutationState::Synthesized);

        let policy = **self.policy.load();
        let mut attempt = 1;
        let apply_error = loop {
            match self.applier.apply(&doc).await {
                Ok(outcome) => {
                    transition(&mutation, MutationState::Applied);
                    return Ok(outcome);
                }
                Err(e) if attempt < policy.attempts => {
                    warn!(
                        mutation = %mutation,
                        attempt,
                        max_attempts = policy.attempts,
                        "Apply failed, retrying: {}",
                        e
                    );
                    attempt += 1;
                    tokio::time::sleep(policy.retry_delay).await;
                }
                Err(e) => break e,
            }
        };

        transition(&mutation, MutationState::ApplyFailed);
        Err(self.compensate(&mutation, compensate, ControlError::Apply(apply_error)))
    }

    /// Reverse the mutation and return the error the caller should see
    fn compensate(
        &self,
        mutation: &str,
        compensate: Compensation,
        cause: ControlError,
    ) -> ControlError {
        match compensate(self.store.as_ref()) {
            Ok(()) => {
                transition(mutation, MutationState::RolledBack);
                self.audit.log(AuditEvent::MutationRolledBack {
                    mutation: mutation.to_string(),
                    apply_error: cause.to_string(),
                });
                cause
            }
            Err(e) => {
                transition(mutation, MutationState::RollbackFailed);
                error!(
                    mutation = %mutation,
                    cause = %cause,
                    "Rollback failed, declared and live state have diverged: {}",
                    e
                );
                self.audit.log(AuditEvent::RollbackFailed {
                    mutation: mutation.to_string(),
                    apply_error: cause.to_string(),
                    reason: e.to_string(),
                });
                ControlError::Rollback {
                    mutation: mutation.to_string(),
                    cause: Box::new(cause),
                    reason: e.to_string(),
                }
            }
        }
    }

    fn write_backup(&self, reason: &str) -> Result<()> {
        let path = self.backup.write(&self.store.snapshot(), reason)?;
        self.audit.log(AuditEvent::BackupWritten {
            path: path.display().to_string(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    fn audit_deleted(&self, entity: &str, id: String) {
        info!("Deleted {} {}", entity, id);
        self.audit.log(AuditEvent::EntityDeleted {
            entity: entity.to_string(),
            id,
        });
    }
}

fn transition(mutation: &str, state: MutationState) {
    match state {
        MutationState::RollbackFailed => error!(mutation, state = %state, "Mutation state"),
        MutationState::ApplyFailed | MutationState::RolledBack => {
            warn!(mutation, state = %state, "Mutation state")
        }
        _ => info!(mutation, state = %state, "Mutation state"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::geo::StaticGeoResolver;
    use crate::model::{CidrRule, PolicyKind};
    use crate::store::MemoryStore;
    use crate::synth::ConfigDocument;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeEngine {
        fail: AtomicBool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ProxyEngine for FakeEngine {
        async fn load(&self, _doc: &ConfigDocument) -> std::result::Result<(), EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                Err(EngineError::Rejected {
                    status: 500,
                    body: "boom".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    fn plane(engine: Arc<FakeEngine>, attempts: u32) -> (ControlPlane, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let geo = StaticGeoResolver::new().with_range("81.2.69.0/24", "GB").unwrap();
        let plane = ControlPlane::new(
            Arc::new(MemoryStore::new()),
            engine,
            Arc::new(geo),
            BackupWriter::new(dir.path()),
            Arc::new(AuditLogger::disabled()),
            ApplyPolicy {
                attempts,
                retry_delay: Duration::from_millis(1),
            },
        );
        (plane, dir)
    }

    #[tokio::test]
    async fn test_create_host_applies_once() {
        let engine = Arc::new(FakeEngine::default());
        let (plane, _dir) = plane(engine.clone(), 1);

        let host = plane
            .create_host(HostSpec::new("example.com", "10.0.0.2", 8080))
            .await
            .unwrap();
        assert_eq!(plane.get_host(host.id).unwrap(), host);
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
        assert!(plane.drift_status().unwrap().in_sync);
    }

    #[tokio::test]
    async fn test_retries_before_compensating() {
        let engine = Arc::new(FakeEngine::default());
        engine.fail.store(true, Ordering::SeqCst);
        let (plane, _dir) = plane(engine.clone(), 3);

        let err = plane
            .create_host(HostSpec::new("example.com", "10.0.0.2", 8080))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Apply(_)));
        assert_eq!(engine.calls.load(Ordering::SeqCst), 3);
        assert!(plane.list_hosts().is_empty());
    }

    #[tokio::test]
    async fn test_policy_test_uses_geo_resolver() {
        let engine = Arc::new(FakeEngine::default());
        let (plane, _dir) = plane(engine, 1);

        let mut policy = AccessPolicy::new("uk only", PolicyKind::GeoWhitelist);
        policy.countries = vec!["GB".to_string()];
        let policy = plane.create_access_policy(policy).await.unwrap();

        let allowed = plane.test_access_policy(policy.id, "81.2.69.160").unwrap();
        assert!(allowed.allowed);
        let denied = plane.test_access_policy(policy.id, "8.8.8.8").unwrap();
        assert_eq!(denied.reason, access::REASON_GEO_FAILED);
        assert!(matches!(
            plane.test_access_policy(policy.id, "nope"),
            Err(ControlError::Validation(_))
        ));
        assert!(matches!(
            plane.test_access_policy(AccessPolicyId::new(), "8.8.8.8"),
            Err(ControlError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_host_with_dependents() {
        let engine = Arc::new(FakeEngine::default());
        let (plane, dir) = plane(engine, 1);

        let mut shared = AccessPolicy::new("shared", PolicyKind::Whitelist);
        shared.rules.push(CidrRule::new("10.0.0.0/8", "lan"));
        let shared = plane.create_access_policy(shared).await.unwrap();

        let mut spec = HostSpec::new("a.example.com", "10.0.0.2", 80);
        spec.access_policy_id = Some(shared.id);
        let a = plane.create_host(spec.clone()).await.unwrap();
        spec.domains = vec!["b.example.com".to_string()];
        let b = plane.create_host(spec).await.unwrap();

        plane
            .delete_host(a.id, DeleteHostOptions { also_delete_dependents: true })
            .await
            .unwrap();
        // Still used by b
        assert!(plane.store().get_access_policy(shared.id).is_some());

        plane
            .delete_host(b.id, DeleteHostOptions { also_delete_dependents: true })
            .await
            .unwrap();
        assert!(plane.store().get_access_policy(shared.id).is_none());
        assert!(plane.list_hosts().is_empty());
        // No certificate involved, so no backup
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_replaced_apply_policy_is_used() {
        let engine = Arc::new(FakeEngine::default());
        engine.fail.store(true, Ordering::SeqCst);
        let (plane, _dir) = plane(engine.clone(), 1);

        let spec = HostSpec::new("example.com", "10.0.0.2", 8080);
        assert!(plane.create_host(spec.clone()).await.is_err());
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);

        plane.set_apply_policy(ApplyPolicy {
            attempts: 4,
            retry_delay: Duration::from_millis(1),
        });
        assert!(plane.create_host(spec).await.is_err());
        assert_eq!(engine.calls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_mutation_state_display() {
        assert_eq!(MutationState::RollbackFailed.to_string(), "rollback_failed");
        assert_eq!(MutationState::Synthesized.to_string(), "synthesized");
    }
}
