//! Declared routing entities
//!
//! Hosts, their locations, certificates, access/auth policies, global security
//! rule sets and the append-only applied-config audit record. Operator input
//! arrives as `HostSpec` / `HostPatch` and is normalized here before it reaches
//! the store.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::rust::double_option;
use uuid::Uuid;

use crate::error::ValidationError;

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

entity_id!(
    /// Stable external id of a Host
    HostId
);
entity_id!(CertificateId);
entity_id!(AccessPolicyId);
entity_id!(AuthPolicyId);
entity_id!(SecurityRuleSetId);

/// Upstream protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamScheme {
    #[default]
    Http,
    Https,
}

impl UpstreamScheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

/// Upstream target of a Host or Location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upstream {
    #[serde(default)]
    pub scheme: UpstreamScheme,
    pub address: String,
    pub port: u16,
}

impl Upstream {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let address = self.address.trim();
        if address.is_empty() {
            return Err(ValidationError::field("upstream.address", "must not be empty"));
        }
        if address.contains('/') || address.contains(char::is_whitespace) {
            return Err(ValidationError::field(
                "upstream.address",
                format!("'{}' is not a host name or address", address),
            ));
        }
        if self.port == 0 {
            return Err(ValidationError::field("upstream.port", "must be in 1-65535"));
        }
        Ok(())
    }

    /// `scheme://address:port`, bracketing IPv6 literals
    pub fn url(&self) -> String {
        let address = self.address.trim();
        if address.contains(':') && !address.starts_with('[') {
            format!("{}://[{}]:{}", self.scheme.as_str(), address, self.port)
        } else {
            format!("{}://{}:{}", self.scheme.as_str(), address, self.port)
        }
    }
}

/// Path-scoped override within a Host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Path prefix, always starting with '/'
    pub path: String,
    /// Upstream override; None proxies to the Host upstream
    #[serde(default)]
    pub upstream: Option<Upstream>,
}

/// A declared proxy route binding domains to an upstream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: HostId,
    pub domains: Vec<String>,
    pub upstream: Upstream,
    #[serde(default)]
    pub force_tls: bool,
    #[serde(default)]
    pub http2: bool,
    #[serde(default)]
    pub hsts: bool,
    #[serde(default)]
    pub hsts_subdomains: bool,
    #[serde(default)]
    pub block_exploits: bool,
    #[serde(default)]
    pub websocket: bool,
    #[serde(default)]
    pub certificate_id: Option<CertificateId>,
    #[serde(default)]
    pub access_policy_id: Option<AccessPolicyId>,
    #[serde(default)]
    pub auth_policy_id: Option<AuthPolicyId>,
    #[serde(default)]
    pub locations: Vec<Location>,
    /// Raw JSON object merged over the synthesized routes of this Host
    #[serde(default)]
    pub advanced_config: Option<String>,
    /// Previous `advanced_config`, kept for revert
    #[serde(default)]
    pub advanced_config_backup: Option<String>,
    pub enabled: bool,
}

impl Host {
    /// Build a Host from operator input, normalizing and validating every field
    pub fn from_spec(spec: HostSpec) -> Result<Self, ValidationError> {
        let host = Self {
            id: HostId::new(),
            domains: normalize_domains(spec.domains)?,
            upstream: spec.upstream,
            force_tls: spec.force_tls,
            http2: spec.http2,
            hsts: spec.hsts,
            hsts_subdomains: spec.hsts_subdomains,
            block_exploits: spec.block_exploits,
            websocket: spec.websocket,
            certificate_id: spec.certificate_id,
            access_policy_id: spec.access_policy_id,
            auth_policy_id: spec.auth_policy_id,
            locations: spec.locations,
            advanced_config: normalize_fragment(spec.advanced_config),
            advanced_config_backup: None,
            enabled: spec.enabled,
        };
        host.validate()?;
        Ok(host)
    }

    /// Return a copy with `patch` applied. Only fields present in the patch change.
    pub fn patched(&self, patch: HostPatch) -> Result<Self, ValidationError> {
        let mut host = self.clone();

        if let Some(domains) = patch.domains {
            host.domains = normalize_domains(domains)?;
        }
        if let Some(upstream) = patch.upstream {
            host.upstream = upstream;
        }
        if let Some(v) = patch.force_tls {
            host.force_tls = v;
        }
        if let Some(v) = patch.http2 {
            host.http2 = v;
        }
        if let Some(v) = patch.hsts {
            host.hsts = v;
        }
        if let Some(v) = patch.hsts_subdomains {
            host.hsts_subdomains = v;
        }
        if let Some(v) = patch.block_exploits {
            host.block_exploits = v;
        }
        if let Some(v) = patch.websocket {
            host.websocket = v;
        }
        if let Some(v) = patch.certificate_id {
            host.certificate_id = v;
        }
        if let Some(v) = patch.access_policy_id {
            host.access_policy_id = v;
        }
        if let Some(v) = patch.auth_policy_id {
            host.auth_policy_id = v;
        }
        if let Some(locations) = patch.locations {
            host.locations = locations;
        }
        if let Some(fragment) = patch.advanced_config {
            let fragment = normalize_fragment(fragment);
            if fragment != host.advanced_config {
                host.advanced_config_backup = host.advanced_config.take();
                host.advanced_config = fragment;
            }
        }
        if let Some(v) = patch.enabled {
            host.enabled = v;
        }

        host.validate()?;
        Ok(host)
    }

    /// Swap the advanced config with its backup
    pub fn reverted(&self) -> Result<Self, ValidationError> {
        if self.advanced_config_backup.is_none() {
            return Err(ValidationError::field(
                "advanced_config_backup",
                format!("host {} has no previous advanced config to revert to", self.id),
            ));
        }
        let mut host = self.clone();
        std::mem::swap(&mut host.advanced_config, &mut host.advanced_config_backup);
        Ok(host)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.domains.is_empty() {
            return Err(ValidationError::field("domains", "at least one domain is required"));
        }
        for domain in &self.domains {
            validate_domain(domain).map_err(|reason| ValidationError::field("domains", reason))?;
        }
        self.upstream.validate()?;

        let mut seen = std::collections::BTreeSet::new();
        for location in &self.locations {
            if !location.path.starts_with('/') {
                return Err(ValidationError::field(
                    "locations.path",
                    format!("'{}' must start with '/'", location.path),
                ));
            }
            if !seen.insert(location.path.as_str()) {
                return Err(ValidationError::DuplicateLocation {
                    host: self.id.to_string(),
                    path: location.path.clone(),
                });
            }
            if let Some(ref upstream) = location.upstream {
                upstream.validate()?;
            }
        }

        if let Some(ref fragment) = self.advanced_config {
            parse_fragment(&self.id.to_string(), fragment)?;
        }
        Ok(())
    }
}

/// Create input for a Host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSpec {
    pub domains: Vec<String>,
    pub upstream: Upstream,
    #[serde(default)]
    pub force_tls: bool,
    #[serde(default)]
    pub http2: bool,
    #[serde(default)]
    pub hsts: bool,
    #[serde(default)]
    pub hsts_subdomains: bool,
    #[serde(default)]
    pub block_exploits: bool,
    #[serde(default)]
    pub websocket: bool,
    #[serde(default)]
    pub certificate_id: Option<CertificateId>,
    #[serde(default)]
    pub access_policy_id: Option<AccessPolicyId>,
    #[serde(default)]
    pub auth_policy_id: Option<AuthPolicyId>,
    #[serde(default)]
    pub locations: Vec<Location>,
    #[serde(default)]
    pub advanced_config: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl HostSpec {
    /// Minimal spec: one domain proxied to `address:port` over plain HTTP
    pub fn new(domain: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            domains: vec![domain.into()],
            upstream: Upstream {
                scheme: UpstreamScheme::Http,
                address: address.into(),
                port,
            },
            force_tls: false,
            http2: false,
            hsts: false,
            hsts_subdomains: false,
            block_exploits: false,
            websocket: false,
            certificate_id: None,
            access_policy_id: None,
            auth_policy_id: None,
            locations: Vec::new(),
            advanced_config: None,
            enabled: true,
        }
    }
}

/// Partial update for a Host. Absent fields are left untouched; for the
/// nullable references and the advanced config an explicit `null` clears them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domains: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<Upstream>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_tls: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http2: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hsts: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hsts_subdomains: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_exploits: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub websocket: Option<bool>,
    #[serde(default, with = "double_option", skip_serializing_if = "Option::is_none")]
    pub certificate_id: Option<Option<CertificateId>>,
    #[serde(default, with = "double_option", skip_serializing_if = "Option::is_none")]
    pub access_policy_id: Option<Option<AccessPolicyId>>,
    #[serde(default, with = "double_option", skip_serializing_if = "Option::is_none")]
    pub auth_policy_id: Option<Option<AuthPolicyId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locations: Option<Vec<Location>>,
    #[serde(default, with = "double_option", skip_serializing_if = "Option::is_none")]
    pub advanced_config: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

/// PEM material for explicit TLS. Issuance is out of scope.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    /// Assigned by the control plane on create
    #[serde(default)]
    pub id: CertificateId,
    pub name: String,
    pub domains: Vec<String>,
    pub certificate_pem: String,
    pub private_key_pem: String,
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("domains", &self.domains)
            .field("private_key_pem", &"<redacted>")
            .finish()
    }
}

impl Certificate {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.certificate_pem.contains("-----BEGIN CERTIFICATE-----") {
            return Err(ValidationError::field(
                "certificate_pem",
                "no PEM certificate block found",
            ));
        }
        if !self.private_key_pem.contains("PRIVATE KEY-----") {
            return Err(ValidationError::field(
                "private_key_pem",
                "no PEM private key block found",
            ));
        }
        for domain in &self.domains {
            validate_domain(domain).map_err(|reason| ValidationError::field("domains", reason))?;
        }
        Ok(())
    }
}

/// Access policy flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Default deny; allow on CIDR match
    Whitelist,
    /// Default allow; deny on CIDR match
    Blacklist,
    /// Allow only listed countries
    GeoWhitelist,
}

impl PolicyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Whitelist => "whitelist",
            Self::Blacklist => "blacklist",
            Self::GeoWhitelist => "geo_whitelist",
        }
    }
}

/// One CIDR rule with an operator-facing description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CidrRule {
    pub cidr: String,
    #[serde(default)]
    pub description: String,
}

impl CidrRule {
    pub fn new(cidr: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            cidr: cidr.into(),
            description: description.into(),
        }
    }
}

/// Named allow/deny rule set for client addresses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPolicy {
    /// Assigned by the control plane on create
    #[serde(default)]
    pub id: AccessPolicyId,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub kind: PolicyKind,
    #[serde(default)]
    pub rules: Vec<CidrRule>,
    /// ISO 3166-1 alpha-2 codes
    #[serde(default)]
    pub countries: Vec<String>,
    #[serde(default)]
    pub local_network_only: bool,
}

impl AccessPolicy {
    pub fn new(name: impl Into<String>, kind: PolicyKind) -> Self {
        Self {
            id: AccessPolicyId::new(),
            name: name.into(),
            enabled: true,
            kind,
            rules: Vec::new(),
            countries: Vec::new(),
            local_network_only: false,
        }
    }
}

/// Forward-auth binding. Identity providers themselves are managed elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPolicy {
    /// Assigned by the control plane on create
    #[serde(default)]
    pub id: AuthPolicyId,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Endpoint the proxy consults before forwarding
    pub forward_auth_url: String,
    /// Response headers copied from the auth endpoint to the upstream request
    #[serde(default)]
    pub copy_headers: Vec<String>,
}

/// Global rule-engine mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuleMode {
    /// Log matches only
    #[default]
    Monitor,
    /// Reject matching requests
    Block,
}

/// Signature content applied to every Host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityRuleSet {
    /// Assigned by the control plane on create
    #[serde(default)]
    pub id: SecurityRuleSetId,
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub mode: RuleMode,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Append-only record of one apply attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedConfigRecord {
    pub content_hash: String,
    pub applied_at: DateTime<Utc>,
    pub success: bool,
    pub error_message: Option<String>,
}

/// Whole declared state at one instant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub hosts: BTreeMap<HostId, Host>,
    #[serde(default)]
    pub certificates: BTreeMap<CertificateId, Certificate>,
    #[serde(default)]
    pub access_policies: BTreeMap<AccessPolicyId, AccessPolicy>,
    #[serde(default)]
    pub auth_policies: BTreeMap<AuthPolicyId, AuthPolicy>,
    #[serde(default)]
    pub security_rule_sets: BTreeMap<SecurityRuleSetId, SecurityRuleSet>,
}

fn default_true() -> bool {
    true
}

/// Lower-case, trim, de-duplicate and sort domain names
fn normalize_domains(domains: Vec<String>) -> Result<Vec<String>, ValidationError> {
    let mut out: Vec<String> = domains
        .into_iter()
        .map(|d| d.trim().trim_end_matches('.').to_ascii_lowercase())
        .collect();
    out.sort();
    out.dedup();
    if out.iter().any(String::is_empty) {
        return Err(ValidationError::field("domains", "domain name is empty"));
    }
    Ok(out)
}

/// Blank fragments are treated as absent
fn normalize_fragment(fragment: Option<String>) -> Option<String> {
    fragment.filter(|f| !f.trim().is_empty())
}

/// Parse an advanced-config fragment; it must be a JSON object
pub fn parse_fragment(
    host: &str,
    fragment: &str,
) -> Result<serde_json::Map<String, serde_json::Value>, ValidationError> {
    match serde_json::from_str::<serde_json::Value>(fragment) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(other) => Err(ValidationError::InvalidAdvancedConfig {
            host: host.to_string(),
            reason: format!("expected a JSON object, found {}", json_type_name(&other)),
        }),
        Err(e) => Err(ValidationError::InvalidAdvancedConfig {
            host: host.to_string(),
            reason: e.to_string(),
        }),
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

/// Validate a domain name against RFC 1035 characters. A leading `*.` wildcard is allowed.
pub fn validate_domain(domain: &str) -> Result<(), String> {
    if domain.is_empty() {
        return Err("domain name is empty".to_string());
    }
    if domain.len() > 253 {
        return Err(format!(
            "domain name exceeds 253 characters (len={})",
            domain.len()
        ));
    }
    let valid = domain
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '*');
    if !valid {
        return Err(format!(
            "domain name '{}' contains characters not permitted by RFC 1035",
            domain
        ));
    }
    if domain.contains("..") || domain.starts_with('.') {
        return Err(format!("domain name '{}' has an empty label", domain));
    }
    if domain[1..].contains('*') || (domain.starts_with('*') && !domain.starts_with("*.")) {
        return Err(format!("domain name '{}' has a misplaced wildcard", domain));
    }
    if domain.split('.').any(|label| label.len() > 63) {
        return Err(format!("domain name '{}' has a label over 63 characters", domain));
    }
    Ok(())
}
