//! Read/write facade over an auto-scaling group: members, tags, suspended
//! processes, capacity bounds and lifecycle hooks.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use autospot_common::defaults::TERMINATING_LIFECYCLE_TRANSITION;
use autospot_common::tags::TagFilter;
use autospot_common::TagFilteringMode;

use crate::aws::autoscaling::AutoScalingOps;
use crate::config::GroupConfig;
use crate::projection::TemplateRef;
use crate::schedule;

/// One member of a group, as the auto-scaling service reports it.
#[derive(Debug, Clone, Default)]
pub struct GroupMember {
    pub instance_id: String,
    pub availability_zone: String,
    pub lifecycle_state: String,
    pub protected_from_scale_in: bool,
}

impl GroupMember {
    pub fn is_in_service(&self) -> bool {
        self.lifecycle_state == "InService"
    }
}

/// A described auto-scaling group.
#[derive(Debug, Clone, Default)]
pub struct GroupDetails {
    pub name: String,
    pub min_size: i32,
    pub max_size: i32,
    pub desired_capacity: i32,
    pub health_check_grace_period: i64,
    pub launch_template: Option<TemplateRef>,
    pub launch_configuration_name: Option<String>,
    pub suspended_processes: Vec<String>,
    pub tags: BTreeMap<String, String>,
    pub members: Vec<GroupMember>,
}

impl GroupDetails {
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn find_member_by_id(&self, instance_id: &str) -> Option<&GroupMember> {
        self.members.iter().find(|m| m.instance_id == instance_id)
    }

    pub fn has_member(&self, instance_id: &str) -> bool {
        self.find_member_by_id(instance_id).is_some()
    }

    /// Whether this group is selected by the configured tag filters. Opt-in
    /// requires every filter to match; opt-out inverts the match.
    pub fn matches_tag_filters(&self, filters: &[TagFilter], mode: TagFilteringMode) -> bool {
        let matched = filters
            .iter()
            .all(|f| self.tag_value(&f.key) == Some(f.value.as_str()));
        match mode {
            TagFilteringMode::OptIn => matched,
            TagFilteringMode::OptOut => !matched,
        }
    }

    /// Project the effective configuration: flag-level defaults overridden
    /// by this group's tags.
    pub fn effective_config(&self, defaults: &GroupConfig) -> GroupConfig {
        defaults.with_tag_overrides(&self.tags)
    }

    /// The on-demand floor this group must keep, from the effective config.
    /// An absolute number wins over a percentage of the current capacity.
    pub fn min_on_demand_floor(&self, config: &GroupConfig) -> i64 {
        if config.min_on_demand_number > 0 {
            config.min_on_demand_number
        } else {
            (self.members.len() as f64 * config.min_on_demand_percentage / 100.0) as i64
        }
    }

    /// A group needs replacement only while its running on-demand count is
    /// above the configured floor.
    pub fn needs_on_demand_replacement(&self, config: &GroupConfig, running_on_demand: i64) -> bool {
        running_on_demand > self.min_on_demand_floor(config)
    }
}

/// Facade coupling a described group with its effective configuration and
/// the auto-scaling operations acting on it.
pub struct GroupView<'a, A: AutoScalingOps> {
    ops: &'a A,
    pub details: GroupDetails,
    pub config: GroupConfig,
}

impl<'a, A: AutoScalingOps> GroupView<'a, A> {
    pub fn new(ops: &'a A, details: GroupDetails, defaults: &GroupConfig) -> Self {
        let config = details.effective_config(defaults);
        Self {
            ops,
            details,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.details.name
    }

    /// Whether replacement actions are currently allowed for this group by
    /// its cron schedule tags.
    pub fn replacement_window_open(&self, now: DateTime<Utc>) -> bool {
        schedule::replacement_window_open(
            &self.config.cron_schedule,
            &self.config.cron_timezone,
            self.config.cron_schedule_state,
            now,
        )
    }

    /// A group takes part in event-based replacement when the tag filters
    /// select it and its replacement window is open.
    pub fn is_enabled_for_event_based_replacement(
        &self,
        filters: &[TagFilter],
        mode: TagFilteringMode,
        now: DateTime<Utc>,
    ) -> bool {
        self.details.matches_tag_filters(filters, mode) && self.replacement_window_open(now)
    }

    pub async fn suspend_processes(&self, processes: &[&str]) -> Result<()> {
        self.ops
            .suspend_processes(
                self.details.name.clone(),
                processes.iter().map(|p| p.to_string()).collect(),
            )
            .await
    }

    pub async fn resume_processes(&self, processes: &[&str]) -> Result<()> {
        self.ops
            .resume_processes(
                self.details.name.clone(),
                processes.iter().map(|p| p.to_string()).collect(),
            )
            .await
    }

    pub async fn set_max_size(&self, max_size: i32) -> Result<()> {
        self.ops
            .set_max_size(self.details.name.clone(), max_size)
            .await
    }

    /// Attach a spot instance, optionally waiting until the group reports
    /// it as a member.
    pub async fn attach_spot_instance(&self, instance_id: &str, wait: bool) -> Result<()> {
        self.ops
            .attach_instances(self.details.name.clone(), vec![instance_id.to_string()])
            .await?;

        if wait {
            self.wait_for_member(instance_id).await?;
        }
        Ok(())
    }

    async fn wait_for_member(&self, instance_id: &str) -> Result<()> {
        const ATTEMPTS: u32 = 12;

        for attempt in 0..ATTEMPTS {
            match self.ops.describe_group(self.details.name.clone()).await? {
                Some(group) if group.has_member(instance_id) => {
                    debug!(group = %self.details.name, instance_id, "Instance attached");
                    return Ok(());
                }
                Some(_) => {
                    debug!(
                        group = %self.details.name,
                        instance_id,
                        attempt,
                        "Waiting for instance to join the group"
                    );
                }
                None => anyhow::bail!("group {} disappeared while attaching", self.details.name),
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        anyhow::bail!(
            "instance {instance_id} did not join group {} in time",
            self.details.name
        )
    }

    pub async fn detach_instance(&self, instance_id: &str, decrement_desired: bool) -> Result<()> {
        self.ops
            .detach_instance(
                self.details.name.clone(),
                instance_id.to_string(),
                decrement_desired,
            )
            .await
    }

    /// Remove a member through the group. With `respect_grace` the call
    /// waits for the member to be in service first, so a lifecycle hook is
    /// not fired against an instance the group is still bootstrapping.
    pub async fn terminate_instance_in_group(
        &self,
        instance_id: &str,
        decrement_desired: bool,
        respect_grace: bool,
    ) -> Result<()> {
        if respect_grace {
            self.wait_until_in_service(instance_id).await;
        }
        self.ops
            .terminate_instance_in_group(instance_id.to_string(), decrement_desired)
            .await
    }

    async fn wait_until_in_service(&self, instance_id: &str) {
        const ATTEMPTS: u32 = 6;

        for _ in 0..ATTEMPTS {
            match self.ops.describe_group(self.details.name.clone()).await {
                Ok(Some(group)) => {
                    match group.find_member_by_id(instance_id) {
                        Some(member) if member.is_in_service() => return,
                        Some(member) => debug!(
                            instance_id,
                            state = %member.lifecycle_state,
                            "Waiting for member to be in service"
                        ),
                        // Already gone from the group; nothing to wait for.
                        None => return,
                    }
                }
                Ok(None) => return,
                Err(error) => {
                    warn!(%error, "Failed to check member state, proceeding");
                    return;
                }
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        info!(instance_id, "Member never reached InService, terminating anyway");
    }

    pub async fn has_termination_lifecycle_hook(&self) -> bool {
        match self
            .ops
            .lifecycle_hook_transitions(self.details.name.clone())
            .await
        {
            Ok(transitions) => transitions
                .iter()
                .any(|t| t == TERMINATING_LIFECYCLE_TRANSITION),
            Err(error) => {
                warn!(group = %self.details.name, %error, "Failed to describe lifecycle hooks");
                false
            }
        }
    }
}
