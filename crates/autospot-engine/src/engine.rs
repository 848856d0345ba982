//! Per-region engine: routes events to the swap coordinator or the
//! termination responder, and drives the cron-mode replace-one action.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::asg::GroupView;
use crate::aws::autoscaling::AutoScalingOps;
use crate::aws::ec2::Ec2Ops;
use crate::catalog::InstanceCatalog;
use crate::compat::{price_ceiling, price_to_bid, CompatibilityFilter};
use crate::config::Config;
use crate::error::{ReplacementError, Result};
use crate::events::EngineEvent;
use crate::fleet::FleetLauncher;
use crate::instance::{AttachReadiness, Instance, InstanceIndex};
use crate::projection::ConfigProjector;
use crate::swap::SwapCoordinator;
use crate::termination::TerminationResponder;

/// Per-region accumulator of human-readable action lines, logged once at
/// the end of a run.
#[derive(Debug, Default)]
pub struct Recap {
    lines: Mutex<BTreeMap<String, Vec<String>>>,
}

impl Recap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, region: &str, line: String) {
        let mut lines = self.lines.lock().expect("recap poisoned");
        lines.entry(region.to_string()).or_default().push(line);
    }

    pub fn log_summary(&self) {
        let lines = self.lines.lock().expect("recap poisoned");
        if lines.is_empty() {
            info!("Run finished without any replacement actions");
            return;
        }
        for (region, actions) in lines.iter() {
            for action in actions {
                info!(region = %region, "{action}");
            }
        }
    }

    #[cfg(test)]
    pub fn lines_for(&self, region: &str) -> Vec<String> {
        self.lines
            .lock()
            .unwrap()
            .get(region)
            .cloned()
            .unwrap_or_default()
    }
}

/// The engine for one region.
pub struct RegionRunner<'a, E: Ec2Ops, A: AutoScalingOps> {
    pub region: &'a str,
    ec2: &'a E,
    asg: &'a A,
    catalog: &'a InstanceCatalog,
    config: &'a Config,
    recap: &'a Recap,
}

impl<'a, E: Ec2Ops, A: AutoScalingOps> RegionRunner<'a, E, A> {
    pub fn new(
        region: &'a str,
        ec2: &'a E,
        asg: &'a A,
        catalog: &'a InstanceCatalog,
        config: &'a Config,
        recap: &'a Recap,
    ) -> Self {
        Self {
            region,
            ec2,
            asg,
            catalog,
            config,
            recap,
        }
    }

    /// Route one classified event. Recoverable outcomes are logged and end
    /// the event; cloud errors surface for the platform retry channel.
    pub async fn handle_event(&self, event: &EngineEvent) -> Result<()> {
        let outcome = match event {
            EngineEvent::SpotRunning { instance_id, .. } => {
                if self.config.disable_event_based_instance_replacement {
                    debug!(instance_id, "Event-based replacement is disabled");
                    Ok(())
                } else {
                    self.handle_spot_running(instance_id).await
                }
            }
            EngineEvent::InterruptionWarning { instance_id, .. } => {
                TerminationResponder::new(self.ec2, self.asg, self.config)
                    .handle(instance_id, false)
                    .await
            }
            EngineEvent::RebalanceRecommendation { instance_id, .. } => {
                if self.config.disable_instance_rebalance_recommendation {
                    debug!(instance_id, "Rebalance recommendation handling is disabled");
                    Ok(())
                } else {
                    TerminationResponder::new(self.ec2, self.asg, self.config)
                        .handle(instance_id, true)
                        .await
                }
            }
            EngineEvent::Ignored => Ok(()),
        };

        match outcome {
            Err(error) if error.is_recoverable() => {
                info!(region = %self.region, %error, "Event ended without action");
                Ok(())
            }
            other => other,
        }
    }

    /// A freshly launched spot instance reported `running`: attach it to
    /// its group if it is ready, replacing its on-demand target.
    pub async fn handle_spot_running(&self, instance_id: &str) -> Result<()> {
        let Some(spot) = self.ec2.describe_instance(instance_id.to_string()).await? else {
            return Err(ReplacementError::NotEligible(format!(
                "instance {instance_id} no longer exists"
            )));
        };

        if !spot.state.is_running() {
            return Err(ReplacementError::NotEligible(format!(
                "instance {instance_id} is not in the running state"
            )));
        }
        if !spot.is_spot() {
            return Err(ReplacementError::NotEligible(format!(
                "instance {instance_id} is not a spot instance"
            )));
        }
        let Some(group_name) = spot.replacement_target_group() else {
            return Err(ReplacementError::NotEligible(format!(
                "instance {instance_id} was not launched for any group"
            )));
        };

        let Some(details) = self.asg.describe_group(group_name.to_string()).await? else {
            return Err(ReplacementError::NotEligible(format!(
                "group {group_name} no longer exists"
            )));
        };
        if !details.matches_tag_filters(&self.config.tag_filters, self.config.tag_filtering_mode) {
            return Err(ReplacementError::NotEligible(format!(
                "group {group_name} is not enabled for replacement"
            )));
        }
        if details.has_member(&spot.id) {
            // A replay of an already-processed event; nothing left to do.
            info!(instance_id, group = %group_name, "Instance is already attached");
            return Ok(());
        }

        let group = GroupView::new(self.asg, details, &self.config.group_defaults);
        if !group.replacement_window_open(Utc::now()) {
            return Err(ReplacementError::NotEligible(format!(
                "group {group_name} is outside its replacement schedule"
            )));
        }

        match spot.is_ready_to_attach(group.details.health_check_grace_period, Utc::now()) {
            AttachReadiness::Ready => {}
            AttachReadiness::NotYet => {
                info!(
                    instance_id,
                    "Instance is still in its grace period, waiting for the next event"
                );
                return Ok(());
            }
            AttachReadiness::Ineligible => {
                return Err(ReplacementError::NotEligible(format!(
                    "instance {instance_id} is not attachable in its current state"
                )));
            }
        }

        let coordinator = SwapCoordinator::new(self.ec2, self.config.instance_termination_method);
        let replaced = coordinator.swap(&spot, &group).await?;

        self.recap.add(
            self.region,
            format!(
                "swapped on-demand {replaced} for spot {} in group {group_name}",
                spot.id
            ),
        );
        Ok(())
    }

    /// Cron-mode pass over every enabled group: launch one spot replacement
    /// per group that still runs on-demand capacity above its floor. The
    /// launched instance attaches later, when its running event arrives.
    pub async fn run_replacement_cycle(&self) -> Result<Vec<String>> {
        let groups = self.asg.describe_all_groups().await?;
        let now = Utc::now();
        let mut launched = Vec::new();

        for details in groups {
            let group = GroupView::new(self.asg, details, &self.config.group_defaults);
            if !group.is_enabled_for_event_based_replacement(
                &self.config.tag_filters,
                self.config.tag_filtering_mode,
                now,
            ) {
                debug!(group = %group.name(), "Group is not enabled for replacement");
                continue;
            }
            if self.config.billing_only {
                info!(group = %group.name(), "Billing-only mode, skipping replacement");
                continue;
            }

            match self.replace_one(&group).await {
                Ok(Some(spot_id)) => launched.push(spot_id),
                Ok(None) => {}
                Err(error) if error.is_recoverable() => {
                    info!(group = %group.name(), %error, "No replacement launched");
                }
                Err(error) => {
                    warn!(group = %group.name(), %error, "Replacement attempt failed");
                }
            }
        }

        Ok(launched)
    }

    /// Launch a replacement for one eligible on-demand member of `group`.
    async fn replace_one(&self, group: &GroupView<'_, A>) -> Result<Option<String>> {
        // One describe per member, fanned out and collected into the
        // region index; the floor check and the target pick read from the
        // same snapshot.
        let index = InstanceIndex::new();
        let describes = group
            .details
            .members
            .iter()
            .map(|member| self.ec2.describe_instance(member.instance_id.clone()));
        for described in join_all(describes).await.into_iter().flatten().flatten() {
            index.add(described);
        }

        let snapshot = index.snapshot();
        let running_on_demand = snapshot
            .iter()
            .filter(|instance| !instance.is_spot() && instance.state.is_running())
            .count() as i64;
        if !group
            .details
            .needs_on_demand_replacement(&group.config, running_on_demand)
        {
            debug!(group = %group.name(), "Group is at its on-demand floor");
            return Ok(None);
        }

        let Some(target) = self.pick_replacement_target(group, &snapshot).await else {
            debug!(group = %group.name(), "No eligible on-demand member found");
            return Ok(None);
        };

        info!(
            group = %group.name(),
            target = %target.id,
            instance_type = %target.instance_type,
            "Launching spot replacement"
        );
        let spot_id = self.launch_replacement(&target, group).await?;

        self.recap.add(
            self.region,
            format!(
                "launched spot {spot_id} to replace on-demand {} in group {}",
                target.id,
                group.name()
            ),
        );
        Ok(Some(spot_id))
    }

    /// First running, unprotected on-demand member of the group.
    async fn pick_replacement_target(
        &self,
        group: &GroupView<'_, A>,
        snapshot: &[Instance],
    ) -> Option<Instance> {
        let eligible = snapshot.iter().filter(|instance| {
            !instance.is_spot()
                && instance.state.is_running()
                && !group
                    .details
                    .find_member_by_id(&instance.id)
                    .is_some_and(|member| member.protected_from_scale_in)
        });

        for instance in eligible {
            match self
                .ec2
                .is_protected_from_termination(instance.id.clone())
                .await
            {
                Ok(false) => return Some(instance.clone()),
                Ok(true) => debug!(instance_id = %instance.id, "Protected from termination"),
                Err(error) => {
                    warn!(
                        instance_id = %instance.id,
                        %error,
                        "Couldn't check termination protection, assuming protected"
                    );
                }
            }
        }
        None
    }

    /// The replacement pipeline: compatibility filter, configuration
    /// projection, fleet launch.
    async fn launch_replacement(
        &self,
        reference: &Instance,
        group: &GroupView<'_, A>,
    ) -> Result<String> {
        let Some(type_info) = self.catalog.get(&reference.instance_type) else {
            warn!(
                region = %self.region,
                instance_type = %reference.instance_type,
                "Missing instance type information for this region"
            );
            return Err(ReplacementError::NoCandidate);
        };

        let launch_config = match &group.details.launch_configuration_name {
            Some(name) => {
                self.asg
                    .describe_launch_configuration(name.clone())
                    .await
                    .map_err(ReplacementError::Cloud)?
            }
            None => None,
        };
        let template_source = match &group.details.launch_template {
            Some(template) => Some(
                self.ec2
                    .describe_launch_template_version(
                        template.id.clone(),
                        template.version.clone(),
                    )
                    .await
                    .map_err(ReplacementError::Cloud)?,
            ),
            None => None,
        };

        let ceiling = price_ceiling(
            type_info.pricing.on_demand,
            self.config.global_on_demand_price_multiplier,
            group.config.on_demand_price_multiplier,
        );
        let used_ephemeral = launch_config
            .as_ref()
            .map(|lc| lc.ephemeral_device_count)
            .unwrap_or(0);

        let filter = CompatibilityFilter::new(
            reference,
            type_info,
            self.catalog,
            ceiling,
            used_ephemeral,
            &group.config.allowed_instance_types,
            &group.config.disallowed_instance_types,
        );
        let candidates = filter.candidates()?;

        // The bid rides on the cheapest candidate's zone-local price.
        let cheapest_spot = candidates[0].spot_price(&reference.availability_zone);
        let bid = price_to_bid(
            group.config.bidding_policy,
            ceiling,
            cheapest_spot,
            group.config.spot_product_premium,
            group.config.spot_price_buffer_percentage,
        );
        info!(
            group = %group.name(),
            candidates = candidates.len(),
            bid,
            "Compatible spot candidates found"
        );

        let image_block_devices = match &reference.image_id {
            Some(image_id) => match self.ec2.image_block_devices(image_id.clone()).await {
                Ok(mappings) => mappings,
                Err(error) => {
                    warn!(%image_id, %error, "Failed to read image block devices");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        let projector = ConfigProjector {
            region: self.region,
            group_name: group.name(),
            launch_template: group.details.launch_template.as_ref(),
            launch_configuration_name: group.details.launch_configuration_name.as_deref(),
            gp2_conversion_threshold: group.config.gp2_conversion_threshold,
            patch_beanstalk_userdata: group.config.patch_beanstalk_userdata,
        };
        let template_data = projector.assemble(
            reference,
            &image_block_devices,
            template_source.as_ref(),
            launch_config.as_ref(),
            bid,
        );

        FleetLauncher::new(self.ec2)
            .launch_spot_replacement(
                reference,
                template_data,
                &candidates,
                group.config.spot_allocation_strategy,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::{GroupDetails, GroupMember};
    use crate::aws::autoscaling::MockAutoScalingOps;
    use crate::aws::ec2::MockEc2Ops;
    use crate::config::Args;
    use crate::fleet::FleetOutcome;
    use crate::testing::fixtures::{catalog_entry, group_details, on_demand_instance, spot_instance};
    use chrono::Duration;
    use clap::Parser;

    fn test_config() -> Config {
        let args = Args::parse_from(["autospot"]);
        let mut config = Config::from_args(&args).unwrap();
        config.sleep_multiplier = 0;
        config
    }

    fn catalog() -> InstanceCatalog {
        [
            catalog_entry("m5.large", 2, 8.0, 0.096, 0.030),
            catalog_entry("m5a.large", 2, 8.0, 0.086, 0.020),
        ]
        .into_iter()
        .collect()
    }

    fn enabled_group_with_od_member() -> GroupDetails {
        let mut details = group_details("g1", 0, 1, 3);
        details
            .tags
            .insert("spot-enabled".to_string(), "true".to_string());
        details.launch_configuration_name = Some("lc-1".to_string());
        details.members.push(GroupMember {
            instance_id: "i-od".to_string(),
            availability_zone: "us-east-1a".to_string(),
            lifecycle_state: "InService".to_string(),
            protected_from_scale_in: false,
        });
        details
    }

    fn ready_spot() -> Instance {
        let mut spot = spot_instance("i-spot", "m5a.large", "us-east-1a");
        spot.launch_time = Some(Utc::now() - Duration::seconds(600));
        spot.tags
            .insert("launched-for-asg".to_string(), "g1".to_string());
        spot.tags.insert(
            "launched-for-replacing-instance".to_string(),
            "i-od".to_string(),
        );
        spot
    }

    #[tokio::test]
    async fn replayed_running_event_is_a_noop() {
        let mut ec2 = MockEc2Ops::new();
        ec2.expect_describe_instance()
            .returning(|_| Ok(Some(ready_spot())));

        let mut asg = MockAutoScalingOps::new();
        asg.expect_describe_group().returning(|_| {
            let mut details = enabled_group_with_od_member();
            // The spot instance already joined during the first invocation.
            details.members.push(GroupMember {
                instance_id: "i-spot".to_string(),
                availability_zone: "us-east-1a".to_string(),
                lifecycle_state: "InService".to_string(),
                protected_from_scale_in: false,
            });
            Ok(Some(details))
        });
        // No swap side effects on the replay.
        asg.expect_suspend_processes().times(0);
        asg.expect_attach_instances().times(0);

        let (catalog, config, recap) = (catalog(), test_config(), Recap::new());
        let runner = RegionRunner::new("us-east-1", &ec2, &asg, &catalog, &config, &recap);
        runner.handle_spot_running("i-spot").await.unwrap();
    }

    #[tokio::test]
    async fn grace_period_defers_the_attachment() {
        let mut ec2 = MockEc2Ops::new();
        ec2.expect_describe_instance().returning(|_| {
            let mut spot = ready_spot();
            spot.launch_time = Some(Utc::now() - Duration::seconds(10));
            Ok(Some(spot))
        });

        let mut asg = MockAutoScalingOps::new();
        asg.expect_describe_group()
            .returning(|_| Ok(Some(enabled_group_with_od_member())));
        asg.expect_attach_instances().times(0);

        let (catalog, config, recap) = (catalog(), test_config(), Recap::new());
        let runner = RegionRunner::new("us-east-1", &ec2, &asg, &catalog, &config, &recap);
        runner.handle_spot_running("i-spot").await.unwrap();
    }

    #[tokio::test]
    async fn disabled_event_based_replacement_ignores_running_events() {
        let ec2 = MockEc2Ops::new();
        let asg = MockAutoScalingOps::new();
        let catalog = catalog();
        let mut config = test_config();
        config.disable_event_based_instance_replacement = true;
        let recap = Recap::new();

        let runner = RegionRunner::new("us-east-1", &ec2, &asg, &catalog, &config, &recap);
        runner
            .handle_event(&EngineEvent::SpotRunning {
                region: "us-east-1".to_string(),
                instance_id: "i-spot".to_string(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cron_cycle_launches_one_replacement_per_group() {
        let mut ec2 = MockEc2Ops::new();
        ec2.expect_describe_instance()
            .returning(|id| Ok(Some(on_demand_instance(&id, "m5.large", "us-east-1a"))));
        ec2.expect_is_protected_from_termination()
            .returning(|_| Ok(false));
        ec2.expect_image_block_devices().returning(|_| Ok(Vec::new()));
        ec2.expect_create_launch_template().returning(|_, _| Ok(()));
        ec2.expect_create_fleet().times(1).returning(|request| {
            assert_eq!(request.overrides[0].instance_type, "m5a.large");
            Ok(FleetOutcome {
                instance_ids: vec!["i-new-spot".to_string()],
                errors: Vec::new(),
            })
        });
        ec2.expect_delete_launch_template().returning(|_| Ok(()));

        let mut asg = MockAutoScalingOps::new();
        asg.expect_describe_all_groups()
            .returning(|| Ok(vec![enabled_group_with_od_member()]));
        asg.expect_describe_launch_configuration()
            .returning(|_| Ok(Some(Default::default())));

        let (catalog, config, recap) = (catalog(), test_config(), Recap::new());
        let runner = RegionRunner::new("us-east-1", &ec2, &asg, &catalog, &config, &recap);
        let launched = runner.run_replacement_cycle().await.unwrap();

        assert_eq!(launched, ["i-new-spot"]);
        assert_eq!(recap.lines_for("us-east-1").len(), 1);
    }

    #[tokio::test]
    async fn billing_only_takes_no_replacement_action() {
        let ec2 = MockEc2Ops::new();
        let mut asg = MockAutoScalingOps::new();
        asg.expect_describe_all_groups()
            .returning(|| Ok(vec![enabled_group_with_od_member()]));

        let catalog = catalog();
        let mut config = test_config();
        config.billing_only = true;
        let recap = Recap::new();

        let runner = RegionRunner::new("us-east-1", &ec2, &asg, &catalog, &config, &recap);
        let launched = runner.run_replacement_cycle().await.unwrap();
        assert!(launched.is_empty());
    }

    #[tokio::test]
    async fn group_at_its_floor_launches_nothing() {
        let mut ec2 = MockEc2Ops::new();
        ec2.expect_describe_instance()
            .returning(|id| Ok(Some(on_demand_instance(&id, "m5.large", "us-east-1a"))));
        ec2.expect_create_fleet().times(0);

        let mut asg = MockAutoScalingOps::new();
        asg.expect_describe_all_groups().returning(|| {
            let mut details = enabled_group_with_od_member();
            details.tags.insert(
                "autospotting_min_on_demand_number".to_string(),
                "1".to_string(),
            );
            Ok(vec![details])
        });

        let (catalog, config, recap) = (catalog(), test_config(), Recap::new());
        let runner = RegionRunner::new("us-east-1", &ec2, &asg, &catalog, &config, &recap);
        let launched = runner.run_replacement_cycle().await.unwrap();
        assert!(launched.is_empty());
    }
}
