//! autospot-common - Shared constants and lightweight types
//!
//! This crate provides the tag vocabulary, compiled defaults and small
//! configuration enums used across the autospot workspace, without any AWS
//! SDK dependencies to keep it lightweight.
//!
//! ## Modules
//!
//! - [`actions`]: bidding policy, termination action and filter mode enums
//! - [`defaults`]: default configuration values
//! - [`tags`]: resource tag keys written to and read from cloud resources

pub mod actions;
pub mod defaults;
pub mod tags;

pub use actions::{
    BiddingPolicy, InstanceTerminationMethod, ScheduleState, SpotAllocationStrategy,
    TagFilteringMode, TerminationNotificationAction,
};
pub use tags::TagFilter;
