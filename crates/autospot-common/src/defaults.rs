//! Default configuration values shared across the workspace.
//!
//! These constants keep the flag defaults, the per-group tag fallbacks and
//! the test fixtures consistent.

/// Name prefix of the temporary launch template created for a fleet request.
/// The full name is this prefix followed by the replaced instance's id.
pub const TEMPORARY_LAUNCH_TEMPLATE_PREFIX: &str = "AutoSpotting-Temporary-LaunchTemplate-for-";

/// Default number of on-demand instances kept running in each group.
pub const DEFAULT_MIN_ON_DEMAND_NUMBER: i64 = 0;

/// Default percentage of on-demand instances kept running in each group.
pub const DEFAULT_MIN_ON_DEMAND_PERCENTAGE: f64 = 0.0;

/// Default multiplier applied to the on-demand price ceiling.
pub const DEFAULT_ON_DEMAND_PRICE_MULTIPLIER: f64 = 1.0;

/// Default buffer bid above the current spot price under aggressive bidding.
pub const DEFAULT_SPOT_PRICE_BUFFER_PERCENTAGE: f64 = 10.0;

/// Default premium added on top of the spot price for premium products.
pub const DEFAULT_SPOT_PRODUCT_PREMIUM: f64 = 0.0;

/// Default spot product description used for price lookups.
pub const DEFAULT_SPOT_PRODUCT_DESCRIPTION: &str = "Linux/UNIX (Amazon VPC)";

/// EBS volume size in GiB under which gp2 volumes are rewritten to gp3.
/// Above this size gp2 gets better throughput than a baseline gp3 volume.
pub const DEFAULT_GP2_CONVERSION_THRESHOLD: i32 = 170;

/// Default execution schedule, in simplified "hour day-of-week" crontab
/// format. The default allows every hour of every day.
pub const DEFAULT_CRON_SCHEDULE: &str = "* *";

/// Default timezone the cron schedule is evaluated in.
pub const DEFAULT_CRON_TIMEZONE: &str = "UTC";

/// Group filter applied when no explicit tag filters are set (opt-in mode).
pub const DEFAULT_TAG_FILTER_OPT_IN: &str = "spot-enabled=true";

/// Group filter applied when no explicit tag filters are set (opt-out mode).
pub const DEFAULT_TAG_FILTER_OPT_OUT: &str = "spot-enabled=false";

/// Minutes a detached spot instance keeps running before direct termination.
pub const DETACH_TERMINATION_DELAY_MINUTES: u64 = 14;

/// Lifecycle-hook transition that makes the `auto` notification action
/// terminate through the group instead of detaching.
pub const TERMINATING_LIFECYCLE_TRANSITION: &str = "autoscaling:EC2_INSTANCE_TERMINATING";

/// Reconciliation processes suspended for the duration of a swap.
pub const SUSPENDED_PROCESSES: [&str; 4] =
    ["Launch", "Terminate", "ReplaceUnhealthy", "AZRebalance"];
