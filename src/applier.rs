//! Configuration applier
//!
//! Pushes synthesized documents to the proxy engine and keeps the append-only
//! audit trail. The hash of the last document the engine acknowledged is held
//! here; a document with the same hash is not sent again. The applier never
//! retries.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::audit_logger::{AuditEvent, AuditLogger};
use crate::engine::ProxyEngine;
use crate::error::{ApplyError, EngineError};
use crate::model::AppliedConfigRecord;
use crate::store::Store;
use crate::synth::ConfigDocument;

/// Result of a successful `apply`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Engine acknowledged the document
    Applied { hash: String },
    /// Hash matched the last applied document; engine not called
    Skipped { hash: String },
}

impl ApplyOutcome {
    pub fn hash(&self) -> &str {
        match self {
            Self::Applied { hash } | Self::Skipped { hash } => hash,
        }
    }
}

/// Desired vs. applied state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftStatus {
    pub desired_hash: String,
    pub applied_hash: Option<String>,
    pub in_sync: bool,
    pub last_record: Option<AppliedConfigRecord>,
}

pub struct Applier {
    engine: Arc<dyn ProxyEngine>,
    store: Arc<dyn Store>,
    audit: Arc<AuditLogger>,
    last_hash: RwLock<Option<String>>,
}

impl Applier {
    /// The last applied hash is seeded from the store's audit log
    pub fn new(
        engine: Arc<dyn ProxyEngine>,
        store: Arc<dyn Store>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        let last_hash = store.last_successful_applied().map(|r| r.content_hash);
        if let Some(ref hash) = last_hash {
            info!("Last applied config hash: {}", hash);
        }
        Self {
            engine,
            store,
            audit,
            last_hash: RwLock::new(last_hash),
        }
    }

    pub fn last_applied_hash(&self) -> Option<String> {
        self.last_hash.read().clone()
    }

    /// Apply `doc` unless it is already live
    pub async fn apply(&self, doc: &ConfigDocument) -> Result<ApplyOutcome, ApplyError> {
        if self.last_hash.read().as_deref() == Some(doc.hash.as_str()) {
            debug!(hash = %doc.hash, "Config unchanged, skipping apply");
            self.audit.log(AuditEvent::ApplySkipped {
                hash: doc.hash.clone(),
            });
            return Ok(ApplyOutcome::Skipped {
                hash: doc.hash.clone(),
            });
        }
        self.submit(doc).await
    }

    /// Apply `doc` even if its hash matches the last applied one
    pub async fn force_apply(&self, doc: &ConfigDocument) -> Result<ApplyOutcome, ApplyError> {
        self.submit(doc).await
    }

    async fn submit(&self, doc: &ConfigDocument) -> Result<ApplyOutcome, ApplyError> {
        let result = self.engine.load(doc).await;

        let record = AppliedConfigRecord {
            content_hash: doc.hash.clone(),
            applied_at: Utc::now(),
            success: result.is_ok(),
            error_message: result.as_ref().err().map(ToString::to_string),
        };
        if let Err(e) = self.store.append_applied(record) {
            error!(hash = %doc.hash, "Failed to record apply attempt: {}", e);
        }

        match result {
            Ok(()) => {
                *self.last_hash.write() = Some(doc.hash.clone());
                info!(hash = %doc.hash, routes = doc.route_count(), "Config applied");
                self.audit.log(AuditEvent::ConfigApplied {
                    hash: doc.hash.clone(),
                    routes: doc.route_count(),
                });
                Ok(ApplyOutcome::Applied {
                    hash: doc.hash.clone(),
                })
            }
            Err(source) => {
                // A rejection leaves the previous config live; after a timeout or
                // transport failure the live state is unknown.
                if !matches!(source, EngineError::Rejected { .. }) {
                    *self.last_hash.write() = None;
                }
                warn!(hash = %doc.hash, "Config apply failed: {}", source);
                self.audit.log(AuditEvent::ConfigApplyFailed {
                    hash: doc.hash.clone(),
                    error: source.to_string(),
                });
                Err(ApplyError {
                    hash: doc.hash.clone(),
                    source,
                })
            }
        }
    }

    pub fn drift(&self, desired: &ConfigDocument) -> DriftStatus {
        let applied_hash = self.last_applied_hash();
        DriftStatus {
            in_sync: applied_hash.as_deref() == Some(desired.hash.as_str()),
            desired_hash: desired.hash.clone(),
            applied_hash,
            last_record: self.store.applied_records(1).into_iter().next(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Host, HostSpec, Snapshot};
    use crate::store::MemoryStore;
    use crate::synth::synthesize;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Engine that replays scripted results and counts calls
    struct ScriptedEngine {
        results: Mutex<Vec<Result<(), EngineError>>>,
        calls: Mutex<usize>,
    }

    impl ScriptedEngine {
        fn new(mut results: Vec<Result<(), EngineError>>) -> Self {
            results.reverse();
            Self {
                results: Mutex::new(results),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> usize {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl ProxyEngine for ScriptedEngine {
        async fn load(&self, _doc: &ConfigDocument) -> Result<(), EngineError> {
            *self.calls.lock() += 1;
            self.results.lock().pop().unwrap_or(Ok(()))
        }
    }

    fn doc(domain: &str) -> ConfigDocument {
        let host = Host::from_spec(HostSpec::new(domain, "10.0.0.2", 80)).unwrap();
        let mut snapshot = Snapshot::default();
        snapshot.hosts.insert(host.id, host);
        synthesize(&snapshot).unwrap()
    }

    fn applier(engine: Arc<ScriptedEngine>, store: Arc<MemoryStore>) -> Applier {
        Applier::new(engine, store, Arc::new(AuditLogger::disabled()))
    }

    #[tokio::test]
    async fn test_same_document_applied_once() {
        let engine = Arc::new(ScriptedEngine::new(vec![]));
        let store = Arc::new(MemoryStore::new());
        let applier = applier(engine.clone(), store.clone());
        let d = doc("example.com");

        assert!(matches!(applier.apply(&d).await, Ok(ApplyOutcome::Applied { .. })));
        assert!(matches!(applier.apply(&d).await, Ok(ApplyOutcome::Skipped { .. })));
        assert_eq!(engine.calls(), 1);
        assert_eq!(applier.last_applied_hash(), Some(d.hash.clone()));
        assert_eq!(store.applied_records(10).len(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_recorded_with_engine_text() {
        let rejected = EngineError::Rejected {
            status: 400,
            body: "bad route".to_string(),
        };
        let engine = Arc::new(ScriptedEngine::new(vec![Err(rejected.clone())]));
        let store = Arc::new(MemoryStore::new());
        let applier = applier(engine, store.clone());
        let d = doc("example.com");

        let err = applier.apply(&d).await.unwrap_err();
        assert_eq!(err.source, rejected);
        assert_eq!(err.hash, d.hash);

        let record = &store.applied_records(1)[0];
        assert!(!record.success);
        assert!(record.error_message.as_deref().unwrap().contains("bad route"));
        assert_eq!(applier.last_applied_hash(), None);
    }

    #[tokio::test]
    async fn test_timeout_clears_last_hash() {
        let engine = Arc::new(ScriptedEngine::new(vec![
            Ok(()),
            Err(EngineError::Timeout { timeout_ms: 10 }),
        ]));
        let store = Arc::new(MemoryStore::new());
        let applier = applier(engine.clone(), store);
        let a = doc("a.example.com");
        let b = doc("b.example.com");

        applier.apply(&a).await.unwrap();
        assert!(applier.apply(&b).await.is_err());
        assert_eq!(applier.last_applied_hash(), None);

        // Live state unknown, so the old document is sent again
        applier.apply(&a).await.unwrap();
        assert_eq!(engine.calls(), 3);
    }

    #[tokio::test]
    async fn test_drift_and_seeding_from_store() {
        let store = Arc::new(MemoryStore::new());
        let a = doc("a.example.com");
        {
            let applier = applier(Arc::new(ScriptedEngine::new(vec![])), store.clone());
            applier.apply(&a).await.unwrap();
        }

        let engine = Arc::new(ScriptedEngine::new(vec![]));
        let applier = applier(engine.clone(), store);
        assert!(applier.drift(&a).in_sync);
        assert!(matches!(applier.apply(&a).await, Ok(ApplyOutcome::Skipped { .. })));
        assert_eq!(engine.calls(), 0);

        let drift = applier.drift(&doc("b.example.com"));
        assert!(!drift.in_sync);
        assert_eq!(drift.applied_hash, Some(a.hash));
    }

    #[tokio::test]
    async fn test_force_apply_bypasses_hash_check() {
        let engine = Arc::new(ScriptedEngine::new(vec![]));
        let applier = applier(engine.clone(), Arc::new(MemoryStore::new()));
        let d = doc("example.com");
        applier.apply(&d).await.unwrap();
        applier.force_apply(&d).await.unwrap();
        assert_eq!(engine.calls(), 2);
    }
}
