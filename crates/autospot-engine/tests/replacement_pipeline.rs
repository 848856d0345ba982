//! End-to-end checks of the replacement pipeline's pure stages: catalog
//! scan, candidate ordering, bid pricing, template projection and fleet
//! override shaping.

use autospot_common::{BiddingPolicy, SpotAllocationStrategy};
use autospot_engine::catalog::{InstanceCatalog, InstanceTypeInformation};
use autospot_engine::compat::{price_ceiling, price_to_bid, CompatibilityFilter};
use autospot_engine::fleet::build_overrides;
use autospot_engine::instance::{Instance, InstanceLifecycle, InstanceState};
use autospot_engine::projection::{format_max_price, ConfigProjector, LaunchConfigSource};

fn catalog_entry(name: &str, on_demand: f64, spot: f64) -> InstanceTypeInformation {
    let mut info = InstanceTypeInformation {
        instance_type: name.to_string(),
        vcpu: 2,
        memory_gib: 8.0,
        physical_processor: "Intel Xeon Platinum 8175".to_string(),
        virtualization_types: vec!["HVM".to_string()],
        ..Default::default()
    };
    info.pricing.on_demand = on_demand;
    info.pricing.spot.insert("us-east-1a".to_string(), spot);
    info
}

fn reference_instance() -> Instance {
    Instance {
        id: "i-aaa".to_string(),
        lifecycle: InstanceLifecycle::OnDemand,
        state: InstanceState::Running,
        availability_zone: "us-east-1a".to_string(),
        subnet_id: Some("subnet-1".to_string()),
        security_group_ids: vec!["sg-1".to_string()],
        virtualization_type: "hvm".to_string(),
        instance_type: "m5.large".to_string(),
        ..Default::default()
    }
}

/// A simple swap under the default policy: the filter returns the cheaper
/// compatible types ascending by spot price, and the bid is the on-demand
/// price.
#[test]
fn simple_swap_under_the_default_policy() {
    let catalog: InstanceCatalog = [
        catalog_entry("m5.large", 0.096, 0.030),
        catalog_entry("m5a.large", 0.086, 0.028),
        catalog_entry("m5zn.large", 0.165, 0.110),
    ]
    .into_iter()
    .collect();

    let reference = reference_instance();
    let reference_type = catalog.get("m5.large").unwrap().clone();

    let ceiling = price_ceiling(reference_type.pricing.on_demand, 1.0, 1.0);
    assert_eq!(ceiling, 0.096);

    let filter =
        CompatibilityFilter::new(&reference, &reference_type, &catalog, ceiling, 0, &[], &[]);
    let candidates = filter.candidates().unwrap();

    let names: Vec<&str> = candidates
        .iter()
        .map(|c| c.instance_type.as_str())
        .collect();
    // Ascending by zone-local spot price; the pricier type is filtered out.
    assert_eq!(names, ["m5a.large", "m5.large"]);

    let bid = price_to_bid(
        BiddingPolicy::Normal,
        ceiling,
        candidates[0].spot_price(&reference.availability_zone),
        0.0,
        10.0,
    );
    assert_eq!(format_max_price(bid), "0.096");
}

/// Aggressive bidding applies the buffer to the premium-adjusted spot
/// price and stays capped at the on-demand ceiling.
#[test]
fn aggressive_bidding_with_a_product_premium() {
    let bid = price_to_bid(BiddingPolicy::Aggressive, 0.10, 0.05, 0.02, 10.0);
    assert!((bid - 0.053).abs() < 1e-12);
    assert_eq!(format_max_price(bid), "0.053");
}

/// Launched overrides keep the filter's price order, pinned to the
/// reference subnet, with priorities only under the prioritized strategy.
#[test]
fn fleet_overrides_follow_the_candidate_order() {
    let candidates = vec![
        catalog_entry("m5a.large", 0.086, 0.028),
        catalog_entry("m5.large", 0.096, 0.030),
    ];
    let reference = reference_instance();

    let prioritized = build_overrides(
        &reference,
        &candidates,
        SpotAllocationStrategy::CapacityOptimizedPrioritized,
    );
    assert_eq!(prioritized.len(), 2);
    assert_eq!(prioritized[0].instance_type, "m5a.large");
    assert_eq!(prioritized[0].priority, Some(0.0));
    assert_eq!(prioritized[1].priority, Some(1.0));
    assert!(prioritized
        .iter()
        .all(|o| o.subnet_id.as_deref() == Some("subnet-1")));

    let unprioritized =
        build_overrides(&reference, &candidates, SpotAllocationStrategy::CapacityOptimized);
    assert!(unprioritized.iter().all(|o| o.priority.is_none()));
}

/// The projected template always requests the spot market and carries the
/// three identifying tags.
#[test]
fn projection_emits_spot_market_options_and_identifying_tags() {
    let reference = reference_instance();
    let projector = ConfigProjector {
        region: "us-east-1",
        group_name: "g1",
        launch_template: None,
        launch_configuration_name: Some("web-lc"),
        gp2_conversion_threshold: 170,
        patch_beanstalk_userdata: false,
    };

    let spec = projector.assemble(
        &reference,
        &[],
        None,
        Some(&LaunchConfigSource::default()),
        0.096,
    );

    assert_eq!(spec.max_price, "0.096");
    assert_eq!(spec.availability_zone.as_deref(), Some("us-east-1a"));

    let tags: Vec<&str> = spec.tag_specifications[0]
        .tags
        .iter()
        .map(|(key, _)| key.as_str())
        .collect();
    assert!(tags.contains(&"launched-by-autospotting"));
    assert!(tags.contains(&"launched-for-asg"));
    assert!(tags.contains(&"launched-for-replacing-instance"));
    assert!(tags.contains(&"LaunchConfigurationName"));
}
