//! Termination responder: reacts to spot interruption warnings and
//! rebalance recommendations so the group self-heals before the market
//! reclaims the instance.

use std::time::Duration;

use tracing::{debug, info, warn};

use autospot_common::defaults::DETACH_TERMINATION_DELAY_MINUTES;
use autospot_common::tags::LAUNCHED_FOR_ASG_TAG;
use autospot_common::TerminationNotificationAction;

use crate::asg::GroupView;
use crate::aws::autoscaling::AutoScalingOps;
use crate::aws::ec2::Ec2Ops;
use crate::config::Config;
use crate::error::Result;

/// Handles one termination notice or rebalance recommendation.
pub struct TerminationResponder<'a, E: Ec2Ops, A: AutoScalingOps> {
    ec2: &'a E,
    asg: &'a A,
    config: &'a Config,
}

impl<'a, E: Ec2Ops, A: AutoScalingOps> TerminationResponder<'a, E, A> {
    pub fn new(ec2: &'a E, asg: &'a A, config: &'a Config) -> Self {
        Self { ec2, asg, config }
    }

    /// React to a reclaim notice for `instance_id`. `rebalance` marks the
    /// softer rebalance recommendation, where the instance is not yet
    /// doomed.
    pub async fn handle(&self, instance_id: &str, rebalance: bool) -> Result<()> {
        let Some(group_name) = self
            .asg
            .group_name_for_instance(instance_id.to_string())
            .await?
        else {
            debug!(instance_id, "Instance does not belong to an auto-scaling group");
            return Ok(());
        };

        let Some(details) = self.asg.describe_group(group_name.clone()).await? else {
            debug!(group = %group_name, "Group disappeared, nothing to do");
            return Ok(());
        };

        if !details.matches_tag_filters(&self.config.tag_filters, self.config.tag_filtering_mode) {
            debug!(
                group = %group_name,
                "Skipping group: its tags and the filtering mode do not align"
            );
            return Ok(());
        }

        let group = GroupView::new(self.asg, details, &self.config.group_defaults);
        let action = group.config.termination_notification_action;

        info!(
            instance_id,
            group = %group_name,
            action = %action,
            rebalance,
            "Handling spot reclaim notice"
        );

        match action {
            TerminationNotificationAction::Terminate => {
                self.terminate_through_group(instance_id).await
            }
            TerminationNotificationAction::Detach => self.detach(&group, instance_id, rebalance).await,
            TerminationNotificationAction::Auto => {
                if group.has_termination_lifecycle_hook().await {
                    self.terminate_through_group(instance_id).await
                } else {
                    self.detach(&group, instance_id, rebalance).await
                }
            }
        }
    }

    /// Terminate without decrementing the desired capacity, so the group
    /// launches a replacement and any lifecycle hook fires.
    async fn terminate_through_group(&self, instance_id: &str) -> Result<()> {
        self.asg
            .terminate_instance_in_group(instance_id.to_string(), false)
            .await?;
        Ok(())
    }

    /// Detach without decrementing, so the group starts a replacement at
    /// once. A doomed instance additionally loses its group back-reference
    /// and is terminated directly after a delay; a rebalance candidate is
    /// left running.
    async fn detach(
        &self,
        group: &GroupView<'_, A>,
        instance_id: &str,
        rebalance: bool,
    ) -> Result<()> {
        group.detach_instance(instance_id, false).await?;
        info!(instance_id, group = %group.name(), "Detached instance");

        if rebalance {
            return Ok(());
        }

        if let Err(error) = self
            .ec2
            .delete_tag(instance_id.to_string(), LAUNCHED_FOR_ASG_TAG.to_string())
            .await
        {
            warn!(instance_id, %error, "Failed to delete the group back-reference tag");
        }

        self.delayed_termination(instance_id).await
    }

    /// The two-minute warning leaves room for draining; the actual
    /// termination happens well after the market reclaim, catching
    /// instances the provider ended up not taking.
    async fn delayed_termination(&self, instance_id: &str) -> Result<()> {
        let delay = Duration::from_secs(DETACH_TERMINATION_DELAY_MINUTES * 60)
            * self.config.sleep_multiplier;
        info!(instance_id, ?delay, "Sleeping before terminating the detached instance");
        tokio::time::sleep(delay).await;

        self.ec2.terminate_instance(instance_id.to_string()).await?;
        Ok(())
    }
}
