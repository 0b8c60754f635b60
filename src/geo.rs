//! IP enrichment: fill in country and ASN for requests that only carry an
//! address.
//!
//! [`GeoLookup`] is the seam for a GeoIP database. [`StaticGeo`] answers
//! from a fixed table of networks (longest prefix wins) and is what tests
//! and single-host deployments use; [`NoopGeo`] knows nothing.

use std::net::IpAddr;

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use tracing::{debug, warn};

use crate::filter::types::FilterRequest;
use crate::normalize;
use crate::storage::traits::StorageError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeoInfo {
    pub country: Option<String>,
    pub asn: Option<String>,
}

#[async_trait]
pub trait GeoLookup: Send + Sync {
    async fn lookup(&self, ip: IpAddr) -> Result<GeoInfo, StorageError>;

    fn backend_name(&self) -> &'static str;
}

pub struct NoopGeo;

#[async_trait]
impl GeoLookup for NoopGeo {
    async fn lookup(&self, _ip: IpAddr) -> Result<GeoInfo, StorageError> {
        Ok(GeoInfo::default())
    }

    fn backend_name(&self) -> &'static str {
        "noop"
    }
}

#[derive(Default)]
pub struct StaticGeo {
    entries: Vec<(IpNetwork, GeoInfo)>,
}

impl StaticGeo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a network. Country and ASN are normalized on the way in.
    pub fn insert(mut self, network: &str, country: Option<&str>, asn: Option<&str>) -> Result<Self, StorageError> {
        let net = network
            .parse::<IpNetwork>()
            .map_err(|e| StorageError::InvalidQuery(format!("invalid network '{}': {}", network, e)))?;
        let info = GeoInfo {
            country: country.map(normalize::country),
            asn: asn.and_then(normalize::asn),
        };
        self.entries.push((net, info));
        Ok(self)
    }
}

#[async_trait]
impl GeoLookup for StaticGeo {
    async fn lookup(&self, ip: IpAddr) -> Result<GeoInfo, StorageError> {
        Ok(self
            .entries
            .iter()
            .filter(|(net, _)| net.contains(ip))
            .max_by_key(|(net, _)| net.prefix())
            .map(|(_, info)| info.clone())
            .unwrap_or_default())
    }

    fn backend_name(&self) -> &'static str {
        "static"
    }
}

fn missing(v: &Option<String>) -> bool {
    v.as_deref().map_or(true, |s| s.trim().is_empty())
}

/// Fill absent country/ASN from the request IP. Lookup failures leave the
/// request untouched.
pub async fn enrich(geo: &dyn GeoLookup, request: &mut FilterRequest) {
    if !missing(&request.country) && !missing(&request.asn) {
        return;
    }
    let Some(ip) = request.ip.as_deref().and_then(|s| s.trim().parse::<IpAddr>().ok()) else {
        return;
    };

    match geo.lookup(ip).await {
        Ok(info) => {
            if missing(&request.country) {
                request.country = info.country;
            }
            if missing(&request.asn) {
                request.asn = info.asn;
            }
            debug!(%ip, country = ?request.country, asn = ?request.asn, "Enriched request");
        }
        Err(e) => warn!(%ip, backend = geo.backend_name(), error = %e, "Geo lookup failed"),
    }
}
