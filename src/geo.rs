//! Country resolution for geo_whitelist policies
//!
//! Resolution is an external, fallible capability. The decision engine only
//! sees the `GeoResolver` trait; a failed lookup is reported to it as an error,
//! never as a country.

use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use thiserror::Error;
use tracing::{info, warn};

use crate::addr::{cidr_contains, parse_cidr};
use crate::config::GeoConfig;
use crate::error::ValidationError;

/// Geo lookup failure
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GeoLookupError {
    /// No resolver configured or database not loaded
    #[error("geo resolver unavailable")]
    Unavailable,
    /// Address not present in the database
    #[error("no country known for {0}")]
    NotFound(IpAddr),
    /// Database read error
    #[error("geo lookup failed: {0}")]
    Lookup(String),
}

/// Address to ISO 3166-1 alpha-2 country code
pub trait GeoResolver: Send + Sync {
    fn country_code(&self, ip: IpAddr) -> Result<String, GeoLookupError>;
}

/// Resolver used when nothing is configured; every lookup fails
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGeoResolver;

impl GeoResolver for NoGeoResolver {
    fn country_code(&self, _ip: IpAddr) -> Result<String, GeoLookupError> {
        Err(GeoLookupError::Unavailable)
    }
}

/// Fixed CIDR to country table; first matching range wins
#[derive(Debug, Default, Clone)]
pub struct StaticGeoResolver {
    ranges: Vec<(IpNet, String)>,
}

impl StaticGeoResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a range. Country codes are stored upper-case.
    pub fn with_range(mut self, cidr: &str, country: &str) -> Result<Self, ValidationError> {
        let net = parse_cidr(cidr)?;
        self.ranges.push((net, country.trim().to_ascii_uppercase()));
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

impl GeoResolver for StaticGeoResolver {
    fn country_code(&self, ip: IpAddr) -> Result<String, GeoLookupError> {
        self.ranges
            .iter()
            .find(|(net, _)| cidr_contains(net, ip))
            .map(|(_, country)| country.clone())
            .ok_or(GeoLookupError::NotFound(ip))
    }
}

/// Build the resolver described by `[geo]`.
///
/// A configured but unreadable GeoIP database is logged and degrades to the
/// static table, so geo_whitelist policies fail closed rather than the process
/// refusing to start.
pub fn resolver_from_config(config: &GeoConfig) -> anyhow::Result<Arc<dyn GeoResolver>> {
    #[cfg(feature = "geoip")]
    if let Some(ref path) = config.geoip_db_path {
        match GeoIpResolver::open(path) {
            Ok(db) => {
                info!("GeoIP database loaded from {:?}", path);
                return Ok(Arc::new(db));
            }
            Err(e) => warn!("Failed to load GeoIP database from {:?}: {}", path, e),
        }
    }

    #[cfg(not(feature = "geoip"))]
    if config.geoip_db_path.is_some() {
        warn!("geo.geoip_db_path is set but this build lacks the `geoip` feature; ignoring");
    }

    if config.static_ranges.is_empty() {
        info!("No geo resolver configured; geo_whitelist policies will deny");
        return Ok(Arc::new(NoGeoResolver));
    }

    let mut resolver = StaticGeoResolver::new();
    for range in &config.static_ranges {
        resolver = resolver.with_range(&range.cidr, &range.country)?;
    }
    info!("Static geo table loaded with {} ranges", resolver.len());
    Ok(Arc::new(resolver))
}

#[cfg(feature = "geoip")]
mod geoip {
    use std::net::IpAddr;
    use std::path::Path;

    use maxminddb::Reader;

    use super::{GeoLookupError, GeoResolver};

    /// MaxMind country/city database
    pub struct GeoIpResolver {
        reader: Reader<Vec<u8>>,
    }

    impl GeoIpResolver {
        pub fn open(path: impl AsRef<Path>) -> Result<Self, maxminddb::MaxMindDBError> {
            let reader = Reader::open_readfile(path)?;
            Ok(Self { reader })
        }
    }

    impl GeoResolver for GeoIpResolver {
        fn country_code(&self, ip: IpAddr) -> Result<String, GeoLookupError> {
            #[derive(serde::Deserialize)]
            struct Record {
                country: Option<Country>,
            }

            #[derive(serde::Deserialize)]
            struct Country {
                iso_code: Option<String>,
            }

            let record: Record = self.reader.lookup(ip).map_err(|e| match e {
                maxminddb::MaxMindDBError::AddressNotFoundError(_) => {
                    GeoLookupError::NotFound(ip)
                }
                other => GeoLookupError::Lookup(other.to_string()),
            })?;

            record
                .country
                .and_then(|c| c.iso_code)
                .map(|code| code.to_ascii_uppercase())
                .ok_or(GeoLookupError::NotFound(ip))
        }
    }
}

#[cfg(feature = "geoip")]
pub use geoip::GeoIpResolver;
