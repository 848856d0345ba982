//! Static instance-type reference data for a region.
//!
//! The catalog is read-only for the lifetime of an invocation and shared
//! across regions. It is populated by the caller from the static pricing
//! data source; the engine only consumes it.

use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;

/// Hourly pricing attached to an instance type.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PricingBundle {
    /// On-demand price per hour in the region.
    pub on_demand: f64,
    /// Spot price per hour, keyed by availability zone. A missing or zero
    /// entry means the type is unavailable in that zone.
    pub spot: HashMap<String, f64>,
    /// Hourly surcharge for EBS-optimized usage, where it applies.
    pub ebs_surcharge: f64,
}

/// Attributes of a single instance type.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct InstanceTypeInformation {
    pub instance_type: String,
    pub vcpu: u32,
    pub memory_gib: f64,
    pub gpu: u32,
    /// Physical processor family string, e.g. "Intel Xeon Platinum 8175",
    /// "AMD EPYC 7571" or "AWS Graviton2 Processor".
    pub physical_processor: String,
    /// Supported virtualization types ("HVM", "PV"). Empty means HVM-only.
    pub virtualization_types: Vec<String>,
    pub has_instance_store: bool,
    pub instance_store_device_size: f64,
    pub instance_store_device_count: u32,
    pub instance_store_is_ssd: bool,
    pub has_ebs_optimization: bool,
    /// Dedicated EBS throughput in Mbps.
    pub ebs_throughput: f64,
    pub pricing: PricingBundle,
}

impl InstanceTypeInformation {
    /// Spot price of this type in the given zone; zero when unavailable.
    pub fn spot_price(&self, zone: &str) -> f64 {
        self.pricing.spot.get(zone).copied().unwrap_or(0.0)
    }
}

/// Per-region instance-type reference, keyed by type name.
///
/// Backed by a `BTreeMap` so enumeration is lexicographic by type name,
/// which keeps the candidate ordering deterministic when prices tie.
#[derive(Debug, Clone, Default)]
pub struct InstanceCatalog {
    types: BTreeMap<String, InstanceTypeInformation>,
}

impl InstanceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, info: InstanceTypeInformation) {
        self.types.insert(info.instance_type.clone(), info);
    }

    pub fn get(&self, instance_type: &str) -> Option<&InstanceTypeInformation> {
        self.types.get(instance_type)
    }

    /// Iterate all known types in ascending type-name order.
    pub fn iter(&self) -> impl Iterator<Item = &InstanceTypeInformation> {
        self.types.values()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl FromIterator<InstanceTypeInformation> for InstanceCatalog {
    fn from_iter<T: IntoIterator<Item = InstanceTypeInformation>>(iter: T) -> Self {
        let mut catalog = Self::new();
        for info in iter {
            catalog.insert(info);
        }
        catalog
    }
}

/// Instance-type reference data for every region, as handed over by the
/// external data source. The JSON shape is a map from region name to a
/// list of type entries.
#[derive(Debug, Default, Deserialize)]
pub struct RegionCatalogs(HashMap<String, Vec<InstanceTypeInformation>>);

impl RegionCatalogs {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// The catalog for one region; empty when the region is unknown, which
    /// downstream turns into the no-candidate outcome.
    pub fn catalog_for(&self, region: &str) -> InstanceCatalog {
        self.0
            .get(region)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str) -> InstanceTypeInformation {
        InstanceTypeInformation {
            instance_type: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn iteration_is_lexicographic() {
        let catalog: InstanceCatalog =
            [entry("m5a.large"), entry("c5.large"), entry("m5.large")]
                .into_iter()
                .collect();

        let names: Vec<_> = catalog.iter().map(|i| i.instance_type.as_str()).collect();
        assert_eq!(names, ["c5.large", "m5.large", "m5a.large"]);
    }

    #[test]
    fn missing_zone_means_unavailable() {
        let mut info = entry("m5.large");
        info.pricing.spot.insert("us-east-1a".into(), 0.031);

        assert_eq!(info.spot_price("us-east-1a"), 0.031);
        assert_eq!(info.spot_price("us-east-1b"), 0.0);
    }

    #[test]
    fn region_catalogs_parse_from_json() {
        let catalogs = RegionCatalogs::from_json(
            r#"{
                "us-east-1": [
                    {
                        "instance_type": "m5.large",
                        "vcpu": 2,
                        "memory_gib": 8.0,
                        "physical_processor": "Intel Xeon Platinum 8175",
                        "virtualization_types": ["HVM"],
                        "ebs_throughput": 650.0,
                        "pricing": {
                            "on_demand": 0.096,
                            "spot": {"us-east-1a": 0.03},
                            "ebs_surcharge": 0.0
                        }
                    }
                ]
            }"#,
        )
        .unwrap();

        let catalog = catalogs.catalog_for("us-east-1");
        let info = catalog.get("m5.large").unwrap();
        assert_eq!(info.vcpu, 2);
        assert_eq!(info.spot_price("us-east-1a"), 0.03);

        assert!(catalogs.catalog_for("eu-west-1").is_empty());
    }
}
