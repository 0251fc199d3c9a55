//! Configuration synthesis
//!
//! Turns a `Snapshot` of declared state into the single JSON document the
//! proxy engine loads, plus its SHA-256 content hash. Synthesis is a pure
//! function of the snapshot: every collection is emitted in a canonical order,
//! object keys are sorted, and serialization is compact, so the same snapshot
//! always hashes the same.
//!
//! Document layout:
//!
//! ```text
//! {
//!   "version": 1,
//!   "routes": [ { host_id, domain, upstream, tls, middlewares, locations }, ... ],
//!   "certificates": [ { id, domains, certificate_pem, private_key_pem }, ... ],
//!   "security": { "rule_sets": [ { id, name, mode, content }, ... ] }
//! }
//! ```

use std::cmp::Reverse;

use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::ValidationError;
use crate::model::{parse_fragment, Host, Location, Snapshot};

/// Layout version of the synthesized document
pub const DOCUMENT_VERSION: u32 = 1;

/// HSTS max-age emitted for hosts with `hsts` enabled (one year)
const HSTS_MAX_AGE: u64 = 31_536_000;

/// A synthesized proxy configuration and its content hash
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigDocument {
    pub content: Value,
    /// Lower-case hex SHA-256 of `to_bytes()`
    pub hash: String,
}

impl ConfigDocument {
    fn new(content: Value) -> Self {
        let content = canonicalize(content);
        let hash = hex::encode(Sha256::digest(content.to_string().as_bytes()));
        Self { content, hash }
    }

    /// Compact canonical serialization; this is what gets hashed and sent
    pub fn to_bytes(&self) -> Vec<u8> {
        self.content.to_string().into_bytes()
    }

    pub fn route_count(&self) -> usize {
        self.content["routes"].as_array().map_or(0, Vec::len)
    }
}

/// Synthesize the full proxy configuration for `snapshot`.
///
/// Fails without emitting anything if an enabled Host carries an unparseable
/// advanced fragment or references an entity missing from the snapshot.
pub fn synthesize(snapshot: &Snapshot) -> Result<ConfigDocument, ValidationError> {
    let mut routes: Vec<(String, String, Value)> = Vec::new();
    let mut certificate_ids = std::collections::BTreeSet::new();

    for host in snapshot.hosts.values().filter(|h| h.enabled) {
        let host_routes = host_routes(snapshot, host)?;
        if let Some(id) = host.certificate_id {
            certificate_ids.insert(id);
        }
        for (domain, route) in host_routes {
            routes.push((domain, host.id.to_string(), route));
        }
    }
    routes.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));

    let certificates: Vec<Value> = certificate_ids
        .iter()
        .filter_map(|id| snapshot.certificates.get(id))
        .map(|cert| {
            json!({
                "id": cert.id,
                "domains": cert.domains,
                "certificate_pem": cert.certificate_pem,
                "private_key_pem": cert.private_key_pem,
            })
        })
        .collect();

    let mut rule_sets: Vec<_> = snapshot
        .security_rule_sets
        .values()
        .filter(|r| r.enabled)
        .collect();
    rule_sets.sort_by(|a, b| (&a.name, a.id).cmp(&(&b.name, b.id)));
    let rule_sets: Vec<Value> = rule_sets
        .into_iter()
        .map(|r| {
            json!({
                "id": r.id,
                "name": r.name,
                "mode": r.mode,
                "content": r.content,
            })
        })
        .collect();

    let doc = ConfigDocument::new(json!({
        "version": DOCUMENT_VERSION,
        "routes": routes.into_iter().map(|(_, _, r)| r).collect::<Vec<_>>(),
        "certificates": certificates,
        "security": { "rule_sets": rule_sets },
    }));

    debug!(
        hash = %doc.hash,
        routes = doc.route_count(),
        "Synthesized proxy configuration"
    );
    Ok(doc)
}

/// One route per domain of `host`, with the advanced fragment merged in last
fn host_routes(snapshot: &Snapshot, host: &Host) -> Result<Vec<(String, Value)>, ValidationError> {
    let host_id = host.id.to_string();
    let missing = |entity: &'static str, id: String| ValidationError::MissingReference {
        host: host_id.clone(),
        entity,
        id,
    };

    let tls = match host.certificate_id {
        Some(id) => {
            if !snapshot.certificates.contains_key(&id) {
                return Err(missing("certificate", id.to_string()));
            }
            json!({ "mode": "manual", "certificate_id": id })
        }
        None => json!({ "mode": "auto" }),
    };

    let mut middlewares = Vec::new();
    if host.force_tls {
        middlewares.push(json!({ "type": "force_tls" }));
    }
    if host.hsts {
        middlewares.push(json!({
            "type": "hsts",
            "max_age": HSTS_MAX_AGE,
            "include_subdomains": host.hsts_subdomains,
        }));
    }
    if host.http2 {
        middlewares.push(json!({ "type": "http2" }));
    }
    if host.websocket {
        middlewares.push(json!({ "type": "websocket" }));
    }
    if host.block_exploits {
        middlewares.push(json!({ "type": "block_exploits" }));
    }
    if let Some(id) = host.access_policy_id {
        let policy = snapshot
            .access_policies
            .get(&id)
            .ok_or_else(|| missing("access policy", id.to_string()))?;
        if policy.enabled {
            middlewares.push(json!({
                "type": "access_control",
                "policy_id": policy.id,
                "kind": policy.kind,
                "local_network_only": policy.local_network_only,
                "rules": policy.rules,
                "countries": policy.countries,
            }));
        }
    }
    if let Some(id) = host.auth_policy_id {
        let policy = snapshot
            .auth_policies
            .get(&id)
            .ok_or_else(|| missing("auth policy", id.to_string()))?;
        if policy.enabled {
            middlewares.push(json!({
                "type": "forward_auth",
                "url": policy.forward_auth_url,
                "copy_headers": policy.copy_headers,
            }));
        }
    }

    let locations: Vec<Value> = ordered_locations(&host.locations)
        .into_iter()
        .map(|loc| {
            let upstream = loc.upstream.as_ref().unwrap_or(&host.upstream);
            json!({ "path": loc.path, "upstream": upstream.url() })
        })
        .collect();

    let fragment = host
        .advanced_config
        .as_deref()
        .map(|f| parse_fragment(&host_id, f))
        .transpose()?;

    let routes = host
        .domains
        .iter()
        .map(|domain| {
            let route = json!({
                "host_id": host_id,
                "domain": domain,
                "upstream": host.upstream.url(),
                "tls": tls,
                "middlewares": middlewares,
                "locations": locations,
            });
            let route = match fragment {
                Some(ref overlay) => merge_json_values(route, Value::Object(overlay.clone())),
                None => route,
            };
            (domain.clone(), route)
        })
        .collect();
    Ok(routes)
}

/// Longest path prefix first; equal lengths ordered lexically
fn ordered_locations(locations: &[Location]) -> Vec<&Location> {
    let mut ordered: Vec<&Location> = locations.iter().collect();
    ordered.sort_by_key(|l| (Reverse(l.path.len()), l.path.as_str()));
    ordered
}

/// Deep-merge `overlay` into `base`. Objects merge key by key; for every other
/// combination the overlay wins.
pub fn merge_json_values(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_val) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_val) => merge_json_values(base_val, overlay_val),
                    None => overlay_val,
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        (_, overlay) => overlay,
    }
}

/// Rebuild every object with keys in sorted order
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut out = Map::new();
            for (k, v) in entries {
                out.insert(k, canonicalize(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}
