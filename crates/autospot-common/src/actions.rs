//! Small configuration enums with their wire spellings.
//!
//! Every enum here round-trips through the exact strings accepted on the
//! command line and in per-group override tags.

use std::fmt;
use std::str::FromStr;

/// Policy for choosing the spot bid price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BiddingPolicy {
    /// Bid the on-demand price ceiling.
    #[default]
    Normal,
    /// Bid a buffer percentage above the current spot price, capped at the
    /// on-demand price ceiling.
    Aggressive,
}

impl BiddingPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BiddingPolicy::Normal => "normal",
            BiddingPolicy::Aggressive => "aggressive",
        }
    }
}

impl FromStr for BiddingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(BiddingPolicy::Normal),
            "aggressive" => Ok(BiddingPolicy::Aggressive),
            other => Err(format!("unknown bidding policy: {other}")),
        }
    }
}

impl fmt::Display for BiddingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reaction to a spot termination notice or rebalance recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TerminationNotificationAction {
    /// Terminate through the group when it has a terminating lifecycle hook,
    /// detach otherwise.
    #[default]
    Auto,
    /// Terminate through the group, triggering any lifecycle hook.
    Terminate,
    /// Detach so the group launches a replacement immediately.
    Detach,
}

impl TerminationNotificationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationNotificationAction::Auto => "auto",
            TerminationNotificationAction::Terminate => "terminate",
            TerminationNotificationAction::Detach => "detach",
        }
    }
}

impl FromStr for TerminationNotificationAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(TerminationNotificationAction::Auto),
            "terminate" => Ok(TerminationNotificationAction::Terminate),
            "detach" => Ok(TerminationNotificationAction::Detach),
            other => Err(format!("unknown termination notification action: {other}")),
        }
    }
}

impl fmt::Display for TerminationNotificationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the displaced on-demand instance is removed from its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstanceTerminationMethod {
    /// TerminateInstanceInAutoScalingGroup, which honours lifecycle hooks.
    #[default]
    AutoScaling,
    /// Detach from the group and terminate directly. Compatibility mode.
    Detach,
}

impl InstanceTerminationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceTerminationMethod::AutoScaling => "autoscaling",
            InstanceTerminationMethod::Detach => "detach",
        }
    }
}

impl FromStr for InstanceTerminationMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "autoscaling" => Ok(InstanceTerminationMethod::AutoScaling),
            "detach" => Ok(InstanceTerminationMethod::Detach),
            other => Err(format!("unknown instance termination method: {other}")),
        }
    }
}

impl fmt::Display for InstanceTerminationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether tag filters select groups in or out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TagFilteringMode {
    /// Only groups whose tags match every filter are eligible.
    #[default]
    OptIn,
    /// Every group except the matching ones is eligible.
    OptOut,
}

impl TagFilteringMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagFilteringMode::OptIn => "opt-in",
            TagFilteringMode::OptOut => "opt-out",
        }
    }
}

impl FromStr for TagFilteringMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "opt-in" => Ok(TagFilteringMode::OptIn),
            "opt-out" => Ok(TagFilteringMode::OptOut),
            other => Err(format!("unknown tag filtering mode: {other}")),
        }
    }
}

impl fmt::Display for TagFilteringMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the cron schedule selects the hours to act in or to stay idle in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScheduleState {
    #[default]
    On,
    Off,
}

impl ScheduleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleState::On => "on",
            ScheduleState::Off => "off",
        }
    }
}

impl FromStr for ScheduleState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on" => Ok(ScheduleState::On),
            "off" => Ok(ScheduleState::Off),
            other => Err(format!("unknown schedule state: {other}")),
        }
    }
}

impl fmt::Display for ScheduleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Spot allocation strategy forwarded to the fleet request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpotAllocationStrategy {
    /// Capacity-optimized with the override order as launch priority.
    #[default]
    CapacityOptimizedPrioritized,
    CapacityOptimized,
    LowestPrice,
}

impl SpotAllocationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpotAllocationStrategy::CapacityOptimizedPrioritized => {
                "capacity-optimized-prioritized"
            }
            SpotAllocationStrategy::CapacityOptimized => "capacity-optimized",
            SpotAllocationStrategy::LowestPrice => "lowest-price",
        }
    }

    /// True when override priorities must be attached to the fleet request.
    pub fn is_prioritized(&self) -> bool {
        matches!(self, SpotAllocationStrategy::CapacityOptimizedPrioritized)
    }
}

impl FromStr for SpotAllocationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "capacity-optimized-prioritized" => {
                Ok(SpotAllocationStrategy::CapacityOptimizedPrioritized)
            }
            "capacity-optimized" => Ok(SpotAllocationStrategy::CapacityOptimized),
            "lowest-price" => Ok(SpotAllocationStrategy::LowestPrice),
            other => Err(format!("unknown spot allocation strategy: {other}")),
        }
    }
}

impl fmt::Display for SpotAllocationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enums_round_trip_their_wire_spelling() {
        for policy in [BiddingPolicy::Normal, BiddingPolicy::Aggressive] {
            assert_eq!(policy.as_str().parse::<BiddingPolicy>().unwrap(), policy);
        }
        for action in [
            TerminationNotificationAction::Auto,
            TerminationNotificationAction::Terminate,
            TerminationNotificationAction::Detach,
        ] {
            assert_eq!(
                action
                    .as_str()
                    .parse::<TerminationNotificationAction>()
                    .unwrap(),
                action
            );
        }
        for strategy in [
            SpotAllocationStrategy::CapacityOptimizedPrioritized,
            SpotAllocationStrategy::CapacityOptimized,
            SpotAllocationStrategy::LowestPrice,
        ] {
            assert_eq!(
                strategy.as_str().parse::<SpotAllocationStrategy>().unwrap(),
                strategy
            );
        }
    }

    #[test]
    fn unknown_spellings_are_rejected() {
        assert!("normal-ish".parse::<BiddingPolicy>().is_err());
        assert!("opt-maybe".parse::<TagFilteringMode>().is_err());
        assert!("".parse::<ScheduleState>().is_err());
    }

    #[test]
    fn only_the_prioritized_strategy_requests_priorities() {
        assert!(SpotAllocationStrategy::CapacityOptimizedPrioritized.is_prioritized());
        assert!(!SpotAllocationStrategy::CapacityOptimized.is_prioritized());
        assert!(!SpotAllocationStrategy::LowestPrice.is_prioritized());
    }
}
