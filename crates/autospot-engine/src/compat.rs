//! Compatibility filter: reduces the instance-type universe to the list of
//! legal spot replacements for a reference instance, sorted ascending by
//! zone-local effective price.

use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{debug, warn};

use autospot_common::BiddingPolicy;

use crate::catalog::{InstanceCatalog, InstanceTypeInformation};
use crate::error::{ReplacementError, Result};
use crate::instance::Instance;

/// Price ceiling of a reference instance: its on-demand price adjusted by
/// the process-wide and per-group multipliers. Values below 1 model
/// committed-use discounts.
pub fn price_ceiling(on_demand: f64, global_multiplier: f64, group_multiplier: f64) -> f64 {
    on_demand / global_multiplier * group_multiplier
}

/// Bid price for a candidate under the configured bidding policy.
///
/// Normal bids the ceiling itself. Aggressive bids a buffer above the
/// current spot price, net of any product premium, capped at the ceiling.
pub fn price_to_bid(
    policy: BiddingPolicy,
    ceiling: f64,
    current_spot: f64,
    product_premium: f64,
    buffer_percentage: f64,
) -> f64 {
    match policy {
        BiddingPolicy::Normal => ceiling,
        BiddingPolicy::Aggressive => {
            let buffered = (current_spot - product_premium) * (1.0 + buffer_percentage / 100.0)
                + product_premium;
            ceiling.min(buffered)
        }
    }
}

fn is_intel(processor: &str) -> bool {
    // t1.micro is the only type reporting "Variable"; treat it as Intel.
    processor.contains("Intel") || processor.contains("Variable")
}

fn is_amd(processor: &str) -> bool {
    processor.contains("AMD")
}

fn is_intel_compatible(processor: &str) -> bool {
    is_intel(processor) || is_amd(processor)
}

fn is_arm(processor: &str) -> bool {
    // The ARM parts are all named "AWS Graviton ... Processor".
    processor.contains("AWS")
}

fn same_processor_class(reference: &str, candidate: &str) -> bool {
    (is_intel_compatible(reference) && is_intel_compatible(candidate))
        || (is_arm(reference) && is_arm(candidate))
}

fn build_globset(patterns: &[String]) -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        match Glob::new(pattern) {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(error) => warn!(%pattern, %error, "Skipping malformed instance type pattern"),
        }
    }
    builder.build().unwrap_or_else(|error| {
        warn!(%error, "Failed to build instance type matcher, matching nothing");
        GlobSet::empty()
    })
}

/// Inputs for a single compatibility scan over the regional catalog.
pub struct CompatibilityFilter<'a> {
    reference: &'a Instance,
    reference_type: &'a InstanceTypeInformation,
    catalog: &'a InstanceCatalog,
    ceiling: f64,
    /// Ephemeral volumes actually mapped on the reference instance, already
    /// clamped to what its type can hold.
    attached_ephemeral_volumes: u32,
    allowed: GlobSet,
    allowed_is_empty: bool,
    disallowed: GlobSet,
}

impl<'a> CompatibilityFilter<'a> {
    pub fn new(
        reference: &'a Instance,
        reference_type: &'a InstanceTypeInformation,
        catalog: &'a InstanceCatalog,
        ceiling: f64,
        used_ephemeral_mappings: u32,
        allowed_patterns: &[String],
        disallowed_patterns: &[String],
    ) -> Self {
        let attached_ephemeral_volumes =
            used_ephemeral_mappings.min(reference_type.instance_store_device_count);
        Self {
            reference,
            reference_type,
            catalog,
            ceiling,
            attached_ephemeral_volumes,
            allowed: build_globset(allowed_patterns),
            allowed_is_empty: allowed_patterns.is_empty(),
            disallowed: build_globset(disallowed_patterns),
        }
    }

    /// Effective hourly price of a candidate in the reference zone: the
    /// zone-local spot price plus the EBS surcharge when the reference runs
    /// EBS-optimized.
    pub fn effective_price(&self, candidate: &InstanceTypeInformation) -> f64 {
        let mut price = candidate.spot_price(&self.reference.availability_zone);
        if self.reference.ebs_optimized {
            price += candidate.pricing.ebs_surcharge;
        }
        price
    }

    /// All compatible candidates, ascending by effective price. Equal prices
    /// keep ascending type-name order because the catalog is scanned over a
    /// pre-sorted key list and the sort is stable.
    pub fn candidates(&self) -> Result<Vec<InstanceTypeInformation>> {
        if self.catalog.is_empty() {
            warn!(
                zone = %self.reference.availability_zone,
                "Missing instance type information for this region"
            );
            return Err(ReplacementError::NoCandidate);
        }

        let mut acceptable: Vec<(InstanceTypeInformation, f64)> = Vec::new();
        for candidate in self.catalog.iter() {
            let price = self.effective_price(candidate);
            if self.is_compatible(candidate, price) {
                debug!(
                    candidate = %candidate.instance_type,
                    price,
                    "Found compatible spot instance type"
                );
                acceptable.push((candidate.clone(), price));
            }
        }

        if acceptable.is_empty() {
            return Err(ReplacementError::NoCandidate);
        }

        acceptable.sort_by(|a, b| a.1.total_cmp(&b.1));
        Ok(acceptable.into_iter().map(|(info, _)| info).collect())
    }

    fn is_compatible(&self, candidate: &InstanceTypeInformation, price: f64) -> bool {
        self.is_allowed(&candidate.instance_type)
            && self.is_price_compatible(price)
            && self.is_ebs_compatible(candidate)
            && self.is_class_compatible(candidate)
            && self.is_storage_compatible(candidate)
            && self.is_virtualization_compatible(candidate)
    }

    /// Allow-list wins when present; otherwise the deny-list applies.
    fn is_allowed(&self, instance_type: &str) -> bool {
        if !self.allowed_is_empty {
            self.allowed.is_match(instance_type)
        } else {
            !self.disallowed.is_match(instance_type)
        }
    }

    /// Zero means unavailable in the zone, anything above the ceiling is
    /// not worth launching.
    fn is_price_compatible(&self, price: f64) -> bool {
        price > 0.0 && price <= self.ceiling
    }

    fn is_ebs_compatible(&self, candidate: &InstanceTypeInformation) -> bool {
        candidate.ebs_throughput >= self.reference_type.ebs_throughput
    }

    fn is_class_compatible(&self, candidate: &InstanceTypeInformation) -> bool {
        same_processor_class(
            &self.reference_type.physical_processor,
            &candidate.physical_processor,
        ) && candidate.vcpu >= self.reference_type.vcpu
            && candidate.memory_gib >= self.reference_type.memory_gib
            && candidate.gpu >= self.reference_type.gpu
    }

    /// Storage compatibility over the reference's ephemeral volumes:
    /// enough devices, each at least as big, and no downgrade from SSD to
    /// spinning disks. Unconstrained when nothing ephemeral is attached.
    fn is_storage_compatible(&self, candidate: &InstanceTypeInformation) -> bool {
        let attached = self.attached_ephemeral_volumes;
        attached == 0
            || (candidate.instance_store_device_count >= attached
                && candidate.instance_store_device_size
                    >= self.reference_type.instance_store_device_size
                && (candidate.instance_store_is_ssd
                    || candidate.instance_store_is_ssd == self.reference_type.instance_store_is_ssd))
    }

    fn is_virtualization_compatible(&self, candidate: &InstanceTypeInformation) -> bool {
        let current = self.reference.virtualization_type.as_str();
        let supported: &[String] = &candidate.virtualization_types;
        // An empty set means HVM-only.
        if supported.is_empty() {
            return current == "hvm";
        }
        supported.iter().any(|vt| {
            (vt == "HVM" && current == "hvm") || (vt == "PV" && current == "paravirtual")
        })
    }
}
