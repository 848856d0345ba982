//! Configuration: command-line flags, their environment mirrors, and the
//! per-group effective configuration projected from group tags.
//!
//! Precedence, lowest to highest: compiled defaults, process-wide flag
//! values, per-group `autospotting_*` tag overrides. Malformed flags are
//! fatal at startup; malformed tags log and fall back to the flag value.

use std::collections::BTreeMap;
use std::str::FromStr;

use clap::Parser;
use globset::{Glob, GlobSetBuilder};
use tracing::warn;

use autospot_common::defaults;
use autospot_common::tags::{overrides, TagFilter};
use autospot_common::{
    BiddingPolicy, InstanceTerminationMethod, ScheduleState, SpotAllocationStrategy,
    TagFilteringMode, TerminationNotificationAction,
};

use crate::error::{ReplacementError, Result};

/// Command-line surface. Every flag mirrors an environment variable with
/// the uppercased, underscored name.
#[derive(Parser, Debug, Clone)]
#[command(name = "autospot")]
#[command(about = "Replaces on-demand auto-scaling group members with spot instances")]
#[command(version)]
pub struct Args {
    /// Regions to run in, as a comma or whitespace separated list of globs.
    /// All regions when empty.
    #[arg(long = "regions", env = "REGIONS", default_value = "")]
    pub regions: String,

    /// Restrict spot candidates to these instance types (globs accepted).
    #[arg(
        long = "allowed_instance_types",
        env = "ALLOWED_INSTANCE_TYPES",
        default_value = ""
    )]
    pub allowed_instance_types: String,

    /// Never launch spot instances of these types (globs accepted).
    #[arg(
        long = "disallowed_instance_types",
        env = "DISALLOWED_INSTANCE_TYPES",
        default_value = ""
    )]
    pub disallowed_instance_types: String,

    /// Number of on-demand instances kept running in each group.
    #[arg(
        long = "min_on_demand_number",
        env = "MIN_ON_DEMAND_NUMBER",
        default_value_t = defaults::DEFAULT_MIN_ON_DEMAND_NUMBER
    )]
    pub min_on_demand_number: i64,

    /// Percentage of each group kept on-demand. Ignored when
    /// min_on_demand_number is set.
    #[arg(
        long = "min_on_demand_percentage",
        env = "MIN_ON_DEMAND_PERCENTAGE",
        default_value_t = defaults::DEFAULT_MIN_ON_DEMAND_PERCENTAGE
    )]
    pub min_on_demand_percentage: f64,

    /// Multiplier for the on-demand price ceiling; below 1 models volume
    /// discounts.
    #[arg(
        long = "on_demand_price_multiplier",
        env = "ON_DEMAND_PRICE_MULTIPLIER",
        default_value_t = defaults::DEFAULT_ON_DEMAND_PRICE_MULTIPLIER
    )]
    pub on_demand_price_multiplier: f64,

    /// Spot bid policy: "normal" bids the on-demand ceiling, "aggressive"
    /// bids a buffer above the spot price.
    #[arg(long = "bidding_policy", env = "BIDDING_POLICY", default_value = "normal")]
    pub bidding_policy: String,

    /// Percentage bid above the current spot price under aggressive
    /// bidding.
    #[arg(
        long = "spot_price_buffer_percentage",
        env = "SPOT_PRICE_BUFFER_PERCENTAGE",
        default_value_t = defaults::DEFAULT_SPOT_PRICE_BUFFER_PERCENTAGE
    )]
    pub spot_price_buffer_percentage: f64,

    /// Spot product description used for price lookups.
    #[arg(
        long = "spot_product_description",
        env = "SPOT_PRODUCT_DESCRIPTION",
        default_value = defaults::DEFAULT_SPOT_PRODUCT_DESCRIPTION
    )]
    pub spot_product_description: String,

    /// Premium applied on top of the spot price for premium products.
    #[arg(
        long = "spot_product_premium",
        env = "SPOT_PRODUCT_PREMIUM",
        default_value_t = defaults::DEFAULT_SPOT_PRODUCT_PREMIUM
    )]
    pub spot_product_premium: f64,

    /// How replaced on-demand instances leave their group: "autoscaling"
    /// (recommended) or "detach" (compatibility).
    #[arg(
        long = "instance_termination_method",
        env = "INSTANCE_TERMINATION_METHOD",
        default_value = "autoscaling"
    )]
    pub instance_termination_method: String,

    /// Reaction to spot termination notices: auto | terminate | detach.
    #[arg(
        long = "termination_notification_action",
        env = "TERMINATION_NOTIFICATION_ACTION",
        default_value = "auto"
    )]
    pub termination_notification_action: String,

    /// Group tag filtering behavior: opt-in | opt-out.
    #[arg(
        long = "tag_filtering_mode",
        env = "TAG_FILTERING_MODE",
        default_value = "opt-in"
    )]
    pub tag_filtering_mode: String,

    /// Tags that select groups, e.g. "spot-enabled=true,team=vision".
    #[arg(long = "tag_filters", env = "TAG_FILTERS", default_value = "")]
    pub tag_filters: String,

    /// Simplified crontab ("hour day-of-week") for replacement actions.
    #[arg(
        long = "cron_schedule",
        env = "CRON_SCHEDULE",
        default_value = defaults::DEFAULT_CRON_SCHEDULE
    )]
    pub cron_schedule: String,

    /// Timezone the cron schedule is evaluated in.
    #[arg(
        long = "cron_timezone",
        env = "CRON_TIMEZONE",
        default_value = defaults::DEFAULT_CRON_TIMEZONE
    )]
    pub cron_timezone: String,

    /// Act inside ("on") or outside ("off") the cron schedule.
    #[arg(
        long = "cron_schedule_state",
        env = "CRON_SCHEDULE_STATE",
        default_value = "on"
    )]
    pub cron_schedule_state: String,

    /// Patch Elastic Beanstalk user-data to authenticate the
    /// CloudFormation helpers with the instance role.
    #[arg(
        long = "patch_beanstalk_userdata",
        env = "PATCH_BEANSTALK_USERDATA",
        default_value_t = false
    )]
    pub patch_beanstalk_userdata: bool,

    /// Volume size in GiB up to which gp2 volumes are rewritten to gp3.
    #[arg(
        long = "ebs_gp2_conversion_threshold",
        env = "EBS_GP2_CONVERSION_THRESHOLD",
        default_value_t = defaults::DEFAULT_GP2_CONVERSION_THRESHOLD
    )]
    pub ebs_gp2_conversion_threshold: i32,

    /// Spot allocation strategy for the fleet request.
    #[arg(
        long = "spot_allocation_strategy",
        env = "SPOT_ALLOCATION_STRATEGY",
        default_value = "capacity-optimized-prioritized"
    )]
    pub spot_allocation_strategy: String,

    /// Force cron-only operation, ignoring instance state-change events.
    #[arg(
        long = "disable_event_based_instance_replacement",
        env = "DISABLE_EVENT_BASED_INSTANCE_REPLACEMENT",
        default_value_t = false
    )]
    pub disable_event_based_instance_replacement: bool,

    /// Ignore instance rebalance recommendation events.
    #[arg(
        long = "disable_instance_rebalance_recommendation",
        env = "DISABLE_INSTANCE_REBALANCE_RECOMMENDATION",
        default_value_t = false
    )]
    pub disable_instance_rebalance_recommendation: bool,

    /// Take no replacement actions, only log what would happen.
    #[arg(long = "billing_only", env = "BILLING_ONLY", default_value_t = false)]
    pub billing_only: bool,

    /// JSON file with event data, for locally simulating an event-driven
    /// invocation.
    #[arg(long = "event_file", env = "EVENT_FILE", default_value = "")]
    pub event_file: String,

    /// FIFO queue carrying replacement hand-off messages.
    #[arg(long = "sqs_queue_url", env = "SQS_QUEUE_URL", default_value = "")]
    pub sqs_queue_url: String,

    /// JSON file with per-region instance-type reference data, as produced
    /// by the static pricing data source.
    #[arg(long = "instance_data_file", env = "INSTANCE_DATA_FILE", default_value = "")]
    pub instance_data_file: String,
}

/// Per-group effective configuration after the precedence merge.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupConfig {
    pub min_on_demand_number: i64,
    pub min_on_demand_percentage: f64,
    pub on_demand_price_multiplier: f64,
    pub spot_price_buffer_percentage: f64,
    pub spot_product_premium: f64,
    pub bidding_policy: BiddingPolicy,
    pub allowed_instance_types: Vec<String>,
    pub disallowed_instance_types: Vec<String>,
    pub termination_notification_action: TerminationNotificationAction,
    pub cron_schedule: String,
    pub cron_timezone: String,
    pub cron_schedule_state: ScheduleState,
    pub patch_beanstalk_userdata: bool,
    pub gp2_conversion_threshold: i32,
    pub spot_allocation_strategy: SpotAllocationStrategy,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            min_on_demand_number: defaults::DEFAULT_MIN_ON_DEMAND_NUMBER,
            min_on_demand_percentage: defaults::DEFAULT_MIN_ON_DEMAND_PERCENTAGE,
            on_demand_price_multiplier: defaults::DEFAULT_ON_DEMAND_PRICE_MULTIPLIER,
            spot_price_buffer_percentage: defaults::DEFAULT_SPOT_PRICE_BUFFER_PERCENTAGE,
            spot_product_premium: defaults::DEFAULT_SPOT_PRODUCT_PREMIUM,
            bidding_policy: BiddingPolicy::default(),
            allowed_instance_types: Vec::new(),
            disallowed_instance_types: Vec::new(),
            termination_notification_action: TerminationNotificationAction::default(),
            cron_schedule: defaults::DEFAULT_CRON_SCHEDULE.to_string(),
            cron_timezone: defaults::DEFAULT_CRON_TIMEZONE.to_string(),
            cron_schedule_state: ScheduleState::default(),
            patch_beanstalk_userdata: false,
            gp2_conversion_threshold: defaults::DEFAULT_GP2_CONVERSION_THRESHOLD,
            spot_allocation_strategy: SpotAllocationStrategy::default(),
        }
    }
}

impl GroupConfig {
    /// Apply per-group tag overrides on top of this configuration.
    pub fn with_tag_overrides(&self, tags: &BTreeMap<String, String>) -> Self {
        let mut config = self.clone();

        if let Some(v) = tags.get(overrides::MIN_ON_DEMAND_NUMBER) {
            override_parsed(&mut config.min_on_demand_number, v, overrides::MIN_ON_DEMAND_NUMBER);
        }
        if let Some(v) = tags.get(overrides::MIN_ON_DEMAND_PERCENTAGE) {
            override_parsed(
                &mut config.min_on_demand_percentage,
                v,
                overrides::MIN_ON_DEMAND_PERCENTAGE,
            );
        }
        if let Some(v) = tags.get(overrides::ON_DEMAND_PRICE_MULTIPLIER) {
            override_parsed(
                &mut config.on_demand_price_multiplier,
                v,
                overrides::ON_DEMAND_PRICE_MULTIPLIER,
            );
        }
        if let Some(v) = tags.get(overrides::SPOT_PRICE_BUFFER_PERCENTAGE) {
            override_parsed(
                &mut config.spot_price_buffer_percentage,
                v,
                overrides::SPOT_PRICE_BUFFER_PERCENTAGE,
            );
        }
        if let Some(v) = tags.get(overrides::BIDDING_POLICY) {
            override_parsed(&mut config.bidding_policy, v, overrides::BIDDING_POLICY);
        }
        if let Some(v) = tags.get(overrides::ALLOWED_INSTANCE_TYPES) {
            config.allowed_instance_types = split_type_list(v);
        }
        if let Some(v) = tags.get(overrides::DISALLOWED_INSTANCE_TYPES) {
            config.disallowed_instance_types = split_type_list(v);
        }
        if let Some(v) = tags.get(overrides::TERMINATION_NOTIFICATION_ACTION) {
            override_parsed(
                &mut config.termination_notification_action,
                v,
                overrides::TERMINATION_NOTIFICATION_ACTION,
            );
        }
        if let Some(v) = tags.get(overrides::CRON_SCHEDULE) {
            config.cron_schedule = v.clone();
        }
        if let Some(v) = tags.get(overrides::CRON_TIMEZONE) {
            config.cron_timezone = v.clone();
        }
        if let Some(v) = tags.get(overrides::CRON_SCHEDULE_STATE) {
            override_parsed(
                &mut config.cron_schedule_state,
                v,
                overrides::CRON_SCHEDULE_STATE,
            );
        }
        if let Some(v) = tags.get(overrides::PATCH_BEANSTALK_USERDATA) {
            config.patch_beanstalk_userdata = v.eq_ignore_ascii_case("true");
        }
        if let Some(v) = tags.get(overrides::GP2_CONVERSION_THRESHOLD) {
            override_parsed(
                &mut config.gp2_conversion_threshold,
                v,
                overrides::GP2_CONVERSION_THRESHOLD,
            );
        }
        if let Some(v) = tags.get(overrides::SPOT_ALLOCATION_STRATEGY) {
            override_parsed(
                &mut config.spot_allocation_strategy,
                v,
                overrides::SPOT_ALLOCATION_STRATEGY,
            );
        }

        config
    }
}

/// Parse a tag override into its target, keeping the previous value and
/// logging when the tag is malformed.
fn override_parsed<T: FromStr>(target: &mut T, value: &str, tag: &str) {
    match value.parse::<T>() {
        Ok(parsed) => *target = parsed,
        Err(_) => warn!(tag, value, "Ignoring malformed configuration tag"),
    }
}

/// Instance type lists accept comma or whitespace separation.
fn split_type_list(list: &str) -> Vec<String> {
    list.split([',', ' ', '\t'])
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parsed process-wide configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Region glob patterns; empty means every region.
    pub regions: Vec<String>,
    pub main_region: String,
    /// Divisor of the price ceiling; the group-level multiplier multiplies.
    pub global_on_demand_price_multiplier: f64,
    pub spot_product_description: String,
    pub tag_filtering_mode: TagFilteringMode,
    pub tag_filters: Vec<TagFilter>,
    pub instance_termination_method: InstanceTerminationMethod,
    pub disable_event_based_instance_replacement: bool,
    pub disable_instance_rebalance_recommendation: bool,
    pub billing_only: bool,
    pub event_file: Option<String>,
    pub sqs_queue_url: Option<String>,
    pub instance_data_file: Option<String>,
    /// Scales the delayed-termination sleep; zero in tests, one in
    /// production.
    pub sleep_multiplier: u32,
    /// Flag-level knobs, the per-group starting point before tag overrides.
    pub group_defaults: GroupConfig,
}

impl Config {
    /// Validate flags into the runtime configuration. Any malformed value
    /// is a fatal configuration error.
    pub fn from_args(args: &Args) -> Result<Self> {
        let bidding_policy = parse_flag::<BiddingPolicy>(&args.bidding_policy)?;
        let termination_notification_action =
            parse_flag::<TerminationNotificationAction>(&args.termination_notification_action)?;
        let tag_filtering_mode = parse_flag::<TagFilteringMode>(&args.tag_filtering_mode)?;
        let instance_termination_method =
            parse_flag::<InstanceTerminationMethod>(&args.instance_termination_method)?;
        let cron_schedule_state = parse_flag::<ScheduleState>(&args.cron_schedule_state)?;
        let spot_allocation_strategy =
            parse_flag::<SpotAllocationStrategy>(&args.spot_allocation_strategy)?;

        let mut tag_filters = TagFilter::parse_list(&args.tag_filters);
        if tag_filters.is_empty() {
            let default_filter = match tag_filtering_mode {
                TagFilteringMode::OptIn => defaults::DEFAULT_TAG_FILTER_OPT_IN,
                TagFilteringMode::OptOut => defaults::DEFAULT_TAG_FILTER_OPT_OUT,
            };
            tag_filters = TagFilter::parse_list(default_filter);
        }

        let main_region = std::env::var("AWS_REGION")
            .or_else(|_| std::env::var("AWS_DEFAULT_REGION"))
            .unwrap_or_else(|_| "us-east-1".to_string());

        let group_defaults = GroupConfig {
            min_on_demand_number: args.min_on_demand_number,
            min_on_demand_percentage: args.min_on_demand_percentage,
            on_demand_price_multiplier: args.on_demand_price_multiplier,
            spot_price_buffer_percentage: args.spot_price_buffer_percentage,
            spot_product_premium: args.spot_product_premium,
            bidding_policy,
            allowed_instance_types: split_type_list(&args.allowed_instance_types),
            disallowed_instance_types: split_type_list(&args.disallowed_instance_types),
            termination_notification_action,
            cron_schedule: args.cron_schedule.clone(),
            cron_timezone: args.cron_timezone.clone(),
            cron_schedule_state,
            patch_beanstalk_userdata: args.patch_beanstalk_userdata,
            gp2_conversion_threshold: args.ebs_gp2_conversion_threshold,
            spot_allocation_strategy,
        };

        Ok(Self {
            regions: split_type_list(&args.regions),
            main_region,
            global_on_demand_price_multiplier: args.on_demand_price_multiplier,
            spot_product_description: args.spot_product_description.clone(),
            tag_filtering_mode,
            tag_filters,
            instance_termination_method,
            disable_event_based_instance_replacement: args
                .disable_event_based_instance_replacement,
            disable_instance_rebalance_recommendation: args
                .disable_instance_rebalance_recommendation,
            billing_only: args.billing_only,
            event_file: non_empty(&args.event_file),
            sqs_queue_url: non_empty(&args.sqs_queue_url),
            instance_data_file: non_empty(&args.instance_data_file),
            sleep_multiplier: 1,
            group_defaults,
        })
    }

    /// Whether a region name matches the configured region globs.
    pub fn region_enabled(&self, region: &str) -> bool {
        if self.regions.is_empty() {
            return true;
        }
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.regions {
            match Glob::new(pattern) {
                Ok(glob) => {
                    builder.add(glob);
                }
                Err(error) => warn!(%pattern, %error, "Skipping malformed region pattern"),
            }
        }
        match builder.build() {
            Ok(set) => set.is_match(region),
            Err(error) => {
                warn!(%error, "Failed to build region matcher, enabling all regions");
                true
            }
        }
    }
}

fn parse_flag<T: FromStr<Err = String>>(value: &str) -> Result<T> {
    value.parse::<T>().map_err(ReplacementError::Config)
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_args() -> Args {
        Args::parse_from(["autospot"])
    }

    #[test]
    fn defaults_parse_into_a_valid_config() {
        let config = Config::from_args(&default_args()).unwrap();
        assert_eq!(config.group_defaults.bidding_policy, BiddingPolicy::Normal);
        assert_eq!(config.group_defaults.gp2_conversion_threshold, 170);
        assert_eq!(config.tag_filtering_mode, TagFilteringMode::OptIn);
        assert_eq!(
            config.tag_filters,
            vec![TagFilter {
                key: "spot-enabled".to_string(),
                value: "true".to_string()
            }]
        );
        assert!(config.region_enabled("eu-west-1"));
    }

    #[test]
    fn opt_out_mode_flips_the_default_filter() {
        let mut args = default_args();
        args.tag_filtering_mode = "opt-out".to_string();
        let config = Config::from_args(&args).unwrap();
        assert_eq!(config.tag_filters[0].value, "false");
    }

    #[test]
    fn malformed_flags_are_fatal() {
        let mut args = default_args();
        args.bidding_policy = "yolo".to_string();
        assert!(matches!(
            Config::from_args(&args),
            Err(ReplacementError::Config(_))
        ));
    }

    #[test]
    fn region_globs_filter_regions() {
        let mut args = default_args();
        args.regions = "eu-*,us-east-1".to_string();
        let config = Config::from_args(&args).unwrap();
        assert!(config.region_enabled("eu-west-1"));
        assert!(config.region_enabled("us-east-1"));
        assert!(!config.region_enabled("us-west-2"));
    }

    #[test]
    fn tag_overrides_win_over_flag_values() {
        let defaults = GroupConfig::default();
        let mut tags = BTreeMap::new();
        tags.insert(
            overrides::BIDDING_POLICY.to_string(),
            "aggressive".to_string(),
        );
        tags.insert(overrides::MIN_ON_DEMAND_NUMBER.to_string(), "2".to_string());
        tags.insert(
            overrides::ALLOWED_INSTANCE_TYPES.to_string(),
            "m5.*,c5.large".to_string(),
        );
        tags.insert(
            overrides::GP2_CONVERSION_THRESHOLD.to_string(),
            "300".to_string(),
        );

        let config = defaults.with_tag_overrides(&tags);
        assert_eq!(config.bidding_policy, BiddingPolicy::Aggressive);
        assert_eq!(config.min_on_demand_number, 2);
        assert_eq!(config.allowed_instance_types, ["m5.*", "c5.large"]);
        assert_eq!(config.gp2_conversion_threshold, 300);
    }

    #[test]
    fn malformed_tag_overrides_keep_the_flag_value() {
        let defaults = GroupConfig::default();
        let mut tags = BTreeMap::new();
        tags.insert(
            overrides::MIN_ON_DEMAND_NUMBER.to_string(),
            "not-a-number".to_string(),
        );

        let config = defaults.with_tag_overrides(&tags);
        assert_eq!(config.min_on_demand_number, defaults.min_on_demand_number);
    }
}
