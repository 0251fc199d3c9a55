//! PQCrypta Control - control plane for PQCrypta reverse-proxy fleets
//!
//! - Holds declared routing intent (hosts, locations, certificates, access and auth policies)
//! - Synthesizes it into one canonical, hashed proxy configuration document
//! - Applies that document through the proxy engine's admin API, rolling back the
//!   triggering mutation when the apply fails
//! - Evaluates access policies (CIDR whitelist/blacklist, geo, local-network) out of band
//! - Exposes an admin API for all of the above

pub mod access;
pub mod addr;
pub mod admin;
pub mod applier;
pub mod audit_logger;
pub mod backup;
pub mod config;
pub mod engine;
pub mod error;
pub mod geo;
pub mod model;
pub mod orchestrator;
pub mod store;
pub mod synth;

// Re-export commonly used types
pub use access::{decide, AccessDecision};
pub use applier::{Applier, ApplyOutcome, DriftStatus};
pub use config::{ConfigManager, ControlConfig};
pub use engine::{AdminApiEngine, ProxyEngine};
pub use error::{ApplyError, ControlError, EngineError, ValidationError};
pub use geo::{GeoResolver, StaticGeoResolver};
pub use orchestrator::{ApplyPolicy, BulkRebindReport, ControlPlane, DeleteHostOptions};
pub use store::{MemoryStore, Store};
pub use synth::{synthesize, ConfigDocument};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
