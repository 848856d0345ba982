//! Tag keys written to and read from cloud resources.
//!
//! Replacement spot instances are identified by three outgoing tags plus a
//! back-reference to the provisioning descriptor that was cloned for them.
//! Per-group configuration comes in through `autospotting_*` tags on the
//! auto-scaling group.
//!
//! ## Outgoing tag schema
//!
//! | Tag Key | Description |
//! |---------|-------------|
//! | `launched-by-autospotting` | Static marker (`true`) on every replacement |
//! | `launched-for-asg` | Name of the group the instance was launched for |
//! | `launched-for-replacing-instance` | Id of the on-demand instance it replaces |
//! | `LaunchTemplateID` / `LaunchTemplateVersion` | Template pair, when the group uses one |
//! | `LaunchConfigurationName` | Launch configuration, when the group uses one |

/// Marker tag present on every instance launched by autospot.
pub const LAUNCHED_BY_TAG: &str = "launched-by-autospotting";

/// Tag naming the auto-scaling group a replacement was launched for.
pub const LAUNCHED_FOR_ASG_TAG: &str = "launched-for-asg";

/// Tag naming the on-demand instance a replacement is meant to displace.
pub const LAUNCHED_FOR_REPLACING_TAG: &str = "launched-for-replacing-instance";

/// Launch-template back-reference pair, set when the group uses a template.
pub const LAUNCH_TEMPLATE_ID_TAG: &str = "LaunchTemplateID";
pub const LAUNCH_TEMPLATE_VERSION_TAG: &str = "LaunchTemplateVersion";

/// Launch-configuration back-reference, set when the group uses one instead.
pub const LAUNCH_CONFIGURATION_NAME_TAG: &str = "LaunchConfigurationName";

/// Tag the auto-scaling service itself puts on member instances.
pub const GROUP_MEMBERSHIP_TAG: &str = "aws:autoscaling:groupName";

/// Reserved keys that must never be copied over from a source instance.
pub const RESERVED_TAGS: [&str; 6] = [
    LAUNCHED_BY_TAG,
    LAUNCHED_FOR_ASG_TAG,
    LAUNCHED_FOR_REPLACING_TAG,
    LAUNCH_TEMPLATE_ID_TAG,
    LAUNCH_TEMPLATE_VERSION_TAG,
    LAUNCH_CONFIGURATION_NAME_TAG,
];

/// Per-group configuration override tags, read off the auto-scaling group.
pub mod overrides {
    pub const MIN_ON_DEMAND_NUMBER: &str = "autospotting_min_on_demand_number";
    pub const MIN_ON_DEMAND_PERCENTAGE: &str = "autospotting_min_on_demand_percentage";
    pub const ON_DEMAND_PRICE_MULTIPLIER: &str = "autospotting_on_demand_price_multiplier";
    pub const SPOT_PRICE_BUFFER_PERCENTAGE: &str = "autospotting_spot_price_buffer_percentage";
    pub const BIDDING_POLICY: &str = "autospotting_bidding_policy";
    pub const ALLOWED_INSTANCE_TYPES: &str = "autospotting_allowed_instance_types";
    pub const DISALLOWED_INSTANCE_TYPES: &str = "autospotting_disallowed_instance_types";
    pub const TERMINATION_NOTIFICATION_ACTION: &str =
        "autospotting_termination_notification_action";
    pub const CRON_SCHEDULE: &str = "autospotting_cron_schedule";
    pub const CRON_TIMEZONE: &str = "autospotting_cron_timezone";
    pub const CRON_SCHEDULE_STATE: &str = "autospotting_cron_schedule_state";
    pub const PATCH_BEANSTALK_USERDATA: &str = "autospotting_patch_beanstalk_userdata";
    pub const GP2_CONVERSION_THRESHOLD: &str = "autospotting_gp2_conversion_threshold";
    pub const SPOT_ALLOCATION_STRATEGY: &str = "autospotting_spot_allocation_strategy";
}

/// Returns true when a source tag may be propagated to a replacement.
///
/// Provider-namespaced tags (`aws:` prefix) and the reserved autospot keys
/// are dropped; everything else is carried over.
pub fn is_propagatable(key: &str) -> bool {
    !key.starts_with("aws:") && !RESERVED_TAGS.contains(&key)
}

/// A single `key=value` group filter parsed from the `tag_filters` setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagFilter {
    pub key: String,
    pub value: String,
}

impl TagFilter {
    /// Parse one `key=value` pair. Entries without a value are ignored.
    pub fn parse(entry: &str) -> Option<Self> {
        let (key, value) = entry.split_once('=')?;
        let (key, value) = (key.trim(), value.trim());
        if key.is_empty() || value.is_empty() {
            return None;
        }
        Some(Self {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Parse a comma or whitespace separated list of `key=value` pairs.
    pub fn parse_list(filters: &str) -> Vec<Self> {
        filters
            .split([',', ' ', '\t'])
            .filter(|s| !s.is_empty())
            .filter_map(Self::parse)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn propagatable_rejects_reserved_and_provider_tags() {
        assert!(!is_propagatable("aws:autoscaling:groupName"));
        assert!(!is_propagatable("launched-by-autospotting"));
        assert!(!is_propagatable("LaunchTemplateID"));
        assert!(is_propagatable("Name"));
        assert!(is_propagatable("team"));
    }

    #[test]
    fn parse_list_splits_on_commas_and_whitespace() {
        let filters = TagFilter::parse_list("spot-enabled=true,environment=dev team=vision");
        assert_eq!(filters.len(), 3);
        assert_eq!(filters[0].key, "spot-enabled");
        assert_eq!(filters[0].value, "true");
        assert_eq!(filters[2].key, "team");
    }

    #[test]
    fn parse_skips_malformed_entries() {
        assert!(TagFilter::parse("novalue").is_none());
        assert!(TagFilter::parse("=true").is_none());
        assert_eq!(TagFilter::parse_list("a=1,,bogus,b=2").len(), 2);
    }
}
