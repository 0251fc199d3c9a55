//! Access decision engine
//!
//! Evaluates an `AccessPolicy` against a client address and returns an
//! allow/deny verdict with a human-readable reason. Precedence, highest first:
//!
//! 1. Disabled policy: allow ("policy disabled").
//! 2. `local_network_only` + local address: allow ("local network").
//! 3. `local_network_only` + public address: deny, except for blacklists.
//! 4. Kind-specific evaluation: whitelist is default-deny, blacklist is
//!    default-allow, geo_whitelist resolves the country and fails closed.

use std::net::IpAddr;

use ipnet::IpNet;
use serde::Serialize;
use tracing::debug;

use crate::addr::{cidr_contains, is_local_network, parse_addr, parse_cidr};
use crate::error::ValidationError;
use crate::geo::GeoResolver;
use crate::model::{AccessPolicy, CidrRule, PolicyKind};

pub const REASON_DISABLED: &str = "policy disabled";
pub const REASON_LOCAL: &str = "local network";
pub const REASON_PUBLIC_REJECTED: &str = "public address rejected by local-network policy";
pub const REASON_NO_MATCH: &str = "no matching rule";
pub const REASON_NOT_BLACKLISTED: &str = "not blacklisted";
pub const REASON_GEO_FAILED: &str = "geo lookup failed";
pub const REASON_COUNTRY_DENIED: &str = "country not permitted";

/// Verdict for one address
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessDecision {
    pub allowed: bool,
    pub reason: String,
}

impl AccessDecision {
    fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

/// Decide whether `address` may pass `policy`.
///
/// Fails only when the address is not an IP literal or a stored rule is
/// unparseable; a failed geo lookup is a deny, not an error.
pub fn decide(
    policy: &AccessPolicy,
    address: &str,
    geo: &dyn GeoResolver,
) -> Result<AccessDecision, ValidationError> {
    let ip = parse_addr(address)?;
    let decision = decide_ip(policy, ip, geo)?;
    debug!(
        policy = %policy.id,
        kind = policy.kind.as_str(),
        %ip,
        allowed = decision.allowed,
        reason = %decision.reason,
        "Access decision"
    );
    Ok(decision)
}

/// Same as [`decide`] for an already parsed address
pub fn decide_ip(
    policy: &AccessPolicy,
    ip: IpAddr,
    geo: &dyn GeoResolver,
) -> Result<AccessDecision, ValidationError> {
    if !policy.enabled {
        return Ok(AccessDecision::allow(REASON_DISABLED));
    }

    if policy.local_network_only {
        if is_local_network(ip) {
            return Ok(AccessDecision::allow(REASON_LOCAL));
        }
        if policy.kind != PolicyKind::Blacklist {
            return Ok(AccessDecision::deny(REASON_PUBLIC_REJECTED));
        }
    }

    match policy.kind {
        PolicyKind::Whitelist => Ok(match first_match(&policy.rules, ip)? {
            Some((rule, net)) => AccessDecision::allow(rule_reason(rule, "matched", &net)),
            None => AccessDecision::deny(REASON_NO_MATCH),
        }),
        PolicyKind::Blacklist => Ok(match first_match(&policy.rules, ip)? {
            Some((rule, net)) => AccessDecision::deny(rule_reason(rule, "blacklisted by", &net)),
            None => AccessDecision::allow(REASON_NOT_BLACKLISTED),
        }),
        PolicyKind::GeoWhitelist => Ok(match geo.country_code(ip) {
            Ok(country) => {
                if policy
                    .countries
                    .iter()
                    .any(|c| c.trim().eq_ignore_ascii_case(&country))
                {
                    AccessDecision::allow(format!("country {} permitted", country))
                } else {
                    AccessDecision::deny(REASON_COUNTRY_DENIED)
                }
            }
            Err(e) => {
                debug!(%ip, error = %e, "Geo lookup failed, denying");
                AccessDecision::deny(REASON_GEO_FAILED)
            }
        }),
    }
}

/// First rule (in declaration order) whose network contains `ip`
fn first_match(
    rules: &[CidrRule],
    ip: IpAddr,
) -> Result<Option<(&CidrRule, IpNet)>, ValidationError> {
    for rule in rules {
        let net = parse_cidr(&rule.cidr)?;
        if cidr_contains(&net, ip) {
            return Ok(Some((rule, net)));
        }
    }
    Ok(None)
}

fn rule_reason(rule: &CidrRule, fallback_verb: &str, net: &IpNet) -> String {
    let description = rule.description.trim();
    if description.is_empty() {
        format!("{} {}", fallback_verb, net)
    } else {
        description.to_string()
    }
}

/// Validate a policy before it is persisted
pub fn validate_policy(policy: &AccessPolicy) -> Result<(), ValidationError> {
    if policy.name.trim().is_empty() {
        return Err(ValidationError::field("name", "must not be empty"));
    }
    for rule in &policy.rules {
        parse_cidr(&rule.cidr)?;
    }
    for country in &policy.countries {
        let code = country.trim();
        if code.len() != 2 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(ValidationError::field(
                "countries",
                format!("'{}' is not an ISO 3166-1 alpha-2 code", country),
            ));
        }
    }
    if policy.kind == PolicyKind::GeoWhitelist && policy.countries.is_empty() {
        return Err(ValidationError::field(
            "countries",
            "geo_whitelist policy needs at least one country",
        ));
    }
    Ok(())
}
