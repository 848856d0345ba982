//! Swap coordinator: atomically exchanges an on-demand group member for a
//! freshly launched spot instance.
//!
//! Observable order inside a swap: describe target, suspend reconciliation
//! processes, optionally raise MaxSize, attach the spot instance, terminate
//! the on-demand instance, then unwind the restores in reverse order. Any
//! failure short-circuits but always runs the registered restores.

use futures::future::join_all;
use tracing::{debug, info, warn};

use autospot_common::defaults::SUSPENDED_PROCESSES;
use autospot_common::InstanceTerminationMethod;

use crate::asg::GroupView;
use crate::aws::autoscaling::AutoScalingOps;
use crate::aws::ec2::Ec2Ops;
use crate::error::{ReplacementError, Result};
use crate::instance::Instance;

/// Phases of the swap state machine, for logging and error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SwapPhase {
    Locating,
    AttachArmed,
    Attaching,
    TerminatingOnDemand,
    Done,
}

/// Undo actions registered while arming the swap, executed in reverse
/// registration order on every exit path. Errors during unwinding are
/// logged and never mask the swap outcome.
#[derive(Debug, Default)]
struct RestoreStack {
    actions: Vec<RestoreAction>,
}

#[derive(Debug)]
enum RestoreAction {
    ResumeProcesses,
    RestoreMaxSize(i32),
}

impl RestoreStack {
    fn push(&mut self, action: RestoreAction) {
        self.actions.push(action);
    }

    async fn unwind<A: AutoScalingOps>(&mut self, group: &GroupView<'_, A>) {
        while let Some(action) = self.actions.pop() {
            let result = match &action {
                RestoreAction::ResumeProcesses => {
                    group.resume_processes(&SUSPENDED_PROCESSES).await
                }
                RestoreAction::RestoreMaxSize(max) => group.set_max_size(*max).await,
            };
            if let Err(error) = result {
                warn!(?action, %error, "Swap restore action failed");
            }
        }
    }
}

/// Counts the group members that are running on-demand instances, with the
/// member describes fanned out in parallel.
pub async fn running_on_demand_count<E: Ec2Ops, A: AutoScalingOps>(
    ec2: &E,
    group: &GroupView<'_, A>,
) -> i64 {
    let describes = group
        .details
        .members
        .iter()
        .map(|member| ec2.describe_instance(member.instance_id.clone()));

    join_all(describes)
        .await
        .into_iter()
        .filter_map(|described| described.ok().flatten())
        .filter(|instance| !instance.is_spot() && instance.state.is_running())
        .count() as i64
}

/// Drives the swap of one unattached spot instance into its target group.
pub struct SwapCoordinator<'a, E: Ec2Ops> {
    ec2: &'a E,
    termination_method: InstanceTerminationMethod,
}

impl<'a, E: Ec2Ops> SwapCoordinator<'a, E> {
    pub fn new(ec2: &'a E, termination_method: InstanceTerminationMethod) -> Self {
        Self {
            ec2,
            termination_method,
        }
    }

    /// Swap `spot` for the on-demand member it was launched to replace.
    /// Returns the replaced instance's id.
    pub async fn swap<A: AutoScalingOps>(
        &self,
        spot: &Instance,
        group: &GroupView<'_, A>,
    ) -> Result<String> {
        let on_demand = self.locate_target(spot, group).await?;

        let mut restore = RestoreStack::default();
        let result = self
            .exchange(spot, &on_demand, group, &mut restore)
            .await;
        restore.unwind(group).await;

        match &result {
            Ok(replaced) => info!(
                group = %group.name(),
                spot = %spot.id,
                replaced = %replaced,
                phase = ?SwapPhase::Done,
                "Swap complete"
            ),
            Err(error) => warn!(group = %group.name(), spot = %spot.id, %error, "Swap failed"),
        }
        result
    }

    /// LOCATING: resolve and re-describe the on-demand target, and verify
    /// it should still be replaced. An ineligible target also terminates
    /// the pending spot instance, since nothing will ever attach it.
    async fn locate_target<A: AutoScalingOps>(
        &self,
        spot: &Instance,
        group: &GroupView<'_, A>,
    ) -> Result<Instance> {
        debug!(spot = %spot.id, phase = ?SwapPhase::Locating, "Locating swap target");

        let Some(target_id) = spot.replacement_target_instance() else {
            return Err(ReplacementError::NotEligible(format!(
                "spot instance {} has no replacement target tag",
                spot.id
            )));
        };

        let on_demand = match self.ec2.describe_instance(target_id.to_string()).await? {
            Some(instance) => instance,
            None => {
                self.terminate_orphan(spot).await;
                return Err(ReplacementError::NotEligible(format!(
                    "target instance {target_id} no longer exists"
                )));
            }
        };

        if let Err(reason) = self.should_be_replaced(&on_demand, group).await {
            self.terminate_orphan(spot).await;
            return Err(reason);
        }

        Ok(on_demand)
    }

    /// The termination-protection rules of the target: an already-spot,
    /// scale-in-protected or API-termination-protected instance stays. A
    /// failed attribute lookup counts as protected.
    async fn should_be_replaced<A: AutoScalingOps>(
        &self,
        on_demand: &Instance,
        group: &GroupView<'_, A>,
    ) -> Result<()> {
        if on_demand.is_spot() {
            return Err(ReplacementError::NotEligible(format!(
                "target {} is already a spot instance",
                on_demand.id
            )));
        }
        if !on_demand.state.is_running() {
            return Err(ReplacementError::NotEligible(format!(
                "target {} is not running",
                on_demand.id
            )));
        }
        if group
            .details
            .find_member_by_id(&on_demand.id)
            .is_some_and(|member| member.protected_from_scale_in)
        {
            return Err(ReplacementError::NotEligible(format!(
                "target {} is protected from scale-in",
                on_demand.id
            )));
        }

        let protected = match self
            .ec2
            .is_protected_from_termination(on_demand.id.clone())
            .await
        {
            Ok(protected) => protected,
            Err(error) => {
                warn!(
                    instance_id = %on_demand.id,
                    %error,
                    "Couldn't describe instance attributes, assuming protected"
                );
                true
            }
        };
        if protected {
            return Err(ReplacementError::NotEligible(format!(
                "target {} is protected from termination",
                on_demand.id
            )));
        }

        let running_on_demand = running_on_demand_count(self.ec2, group).await;
        if !group
            .details
            .needs_on_demand_replacement(&group.config, running_on_demand)
        {
            return Err(ReplacementError::NotEligible(format!(
                "group {} is already at its on-demand floor",
                group.name()
            )));
        }

        Ok(())
    }

    async fn exchange<A: AutoScalingOps>(
        &self,
        spot: &Instance,
        on_demand: &Instance,
        group: &GroupView<'_, A>,
        restore: &mut RestoreStack,
    ) -> Result<String> {
        debug!(group = %group.name(), phase = ?SwapPhase::AttachArmed, "Arming swap");

        let desired = group.details.desired_capacity;
        let max = group.details.max_size;

        group
            .suspend_processes(&SUSPENDED_PROCESSES)
            .await
            .map_err(ReplacementError::Cloud)?;
        restore.push(RestoreAction::ResumeProcesses);

        // The attach would bounce off a full group.
        if desired == max {
            info!(group = %group.name(), "Temporarily raising MaxSize");
            group
                .set_max_size(max + 1)
                .await
                .map_err(ReplacementError::Cloud)?;
            restore.push(RestoreAction::RestoreMaxSize(max));
        }

        debug!(group = %group.name(), phase = ?SwapPhase::Attaching, "Attaching spot instance");
        if let Err(error) = group.attach_spot_instance(&spot.id, true).await {
            warn!(
                spot = %spot.id,
                group = %group.name(),
                %error,
                "Spot instance couldn't be attached, terminating it"
            );
            self.terminate_orphan(spot).await;
            return Err(ReplacementError::Cloud(error));
        }

        debug!(
            group = %group.name(),
            phase = ?SwapPhase::TerminatingOnDemand,
            "Terminating on-demand instance"
        );
        // A failure past this point leaves the group over capacity with the
        // spot instance attached; the next invocation converges it.
        match self.termination_method {
            InstanceTerminationMethod::AutoScaling => group
                .terminate_instance_in_group(&on_demand.id, true, true)
                .await
                .map_err(ReplacementError::Cloud)?,
            InstanceTerminationMethod::Detach => {
                group
                    .detach_instance(&on_demand.id, true)
                    .await
                    .map_err(ReplacementError::Cloud)?;
                self.ec2
                    .terminate_instance(on_demand.id.clone())
                    .await
                    .map_err(ReplacementError::Cloud)?;
            }
        }

        Ok(on_demand.id.clone())
    }

    /// Terminate a spot instance that will never be attached.
    async fn terminate_orphan(&self, spot: &Instance) {
        if !spot.can_terminate() {
            return;
        }
        if let Err(error) = self.ec2.terminate_instance(spot.id.clone()).await {
            warn!(spot = %spot.id, %error, "Failed to terminate orphaned spot instance");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::autoscaling::MockAutoScalingOps;
    use crate::aws::ec2::MockEc2Ops;
    use crate::config::GroupConfig;
    use crate::instance::{InstanceLifecycle, InstanceState};
    use crate::testing::fixtures::{group_details, on_demand_instance, spot_instance};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    fn target_od() -> Instance {
        on_demand_instance("i-od", "m5.large", "us-east-1a")
    }

    fn pending_spot() -> Instance {
        let mut spot = spot_instance("i-spot", "m5a.large", "us-east-1a");
        spot.tags.insert(
            "launched-for-replacing-instance".to_string(),
            "i-od".to_string(),
        );
        spot.tags
            .insert("launched-for-asg".to_string(), "g1".to_string());
        spot
    }

    /// EC2 mock where the target exists, is unprotected and running.
    fn permissive_ec2() -> MockEc2Ops {
        let mut ec2 = MockEc2Ops::new();
        ec2.expect_describe_instance()
            .returning(|id| Ok(Some(on_demand_instance(&id, "m5.large", "us-east-1a"))));
        ec2.expect_is_protected_from_termination()
            .returning(|_| Ok(false));
        ec2
    }

    fn group_with_member(desired: i32, max: i32) -> crate::asg::GroupDetails {
        let mut details = group_details("g1", 0, desired, max);
        details.members.push(crate::asg::GroupMember {
            instance_id: "i-od".to_string(),
            availability_zone: "us-east-1a".to_string(),
            lifecycle_state: "InService".to_string(),
            protected_from_scale_in: false,
        });
        details
    }

    #[tokio::test]
    async fn tight_capacity_raises_and_restores_max_size() {
        let ec2 = permissive_ec2();

        let max_raised = Arc::new(AtomicBool::new(false));
        let calls: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));

        let mut asg = MockAutoScalingOps::new();
        asg.expect_suspend_processes().times(1).returning(|_, _| Ok(()));
        asg.expect_resume_processes().times(1).returning(|_, _| Ok(()));
        {
            let calls = calls.clone();
            let max_raised = max_raised.clone();
            asg.expect_set_max_size().times(2).returning(move |_, max| {
                calls.lock().unwrap().push(max);
                max_raised.store(true, Ordering::SeqCst);
                Ok(())
            });
        }
        asg.expect_attach_instances().times(1).returning(|_, _| Ok(()));
        asg.expect_describe_group().returning(|_| {
            let mut group = group_with_member(2, 2);
            group.members.push(crate::asg::GroupMember {
                instance_id: "i-spot".to_string(),
                availability_zone: "us-east-1a".to_string(),
                lifecycle_state: "InService".to_string(),
                protected_from_scale_in: false,
            });
            Ok(Some(group))
        });
        asg.expect_terminate_instance_in_group()
            .withf(|id, decrement| id == "i-od" && *decrement)
            .times(1)
            .returning(|_, _| Ok(()));

        let view = GroupView::new(&asg, group_with_member(2, 2), &GroupConfig::default());
        let coordinator =
            SwapCoordinator::new(&ec2, InstanceTerminationMethod::AutoScaling);
        let replaced = coordinator.swap(&pending_spot(), &view).await.unwrap();

        assert_eq!(replaced, "i-od");
        // Raised to 3 while armed, restored to the pre-swap 2 on exit.
        assert_eq!(*calls.lock().unwrap(), vec![3, 2]);
        assert!(max_raised.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn loose_capacity_leaves_max_size_alone() {
        let ec2 = permissive_ec2();

        let mut asg = MockAutoScalingOps::new();
        asg.expect_suspend_processes().times(1).returning(|_, _| Ok(()));
        asg.expect_resume_processes().times(1).returning(|_, _| Ok(()));
        asg.expect_set_max_size().times(0);
        asg.expect_attach_instances().times(1).returning(|_, _| Ok(()));
        asg.expect_describe_group().returning(|_| {
            let mut group = group_with_member(2, 4);
            group.members.push(crate::asg::GroupMember {
                instance_id: "i-spot".to_string(),
                availability_zone: "us-east-1a".to_string(),
                lifecycle_state: "InService".to_string(),
                protected_from_scale_in: false,
            });
            Ok(Some(group))
        });
        asg.expect_terminate_instance_in_group()
            .times(1)
            .returning(|_, _| Ok(()));

        let view = GroupView::new(&asg, group_with_member(2, 4), &GroupConfig::default());
        let coordinator =
            SwapCoordinator::new(&ec2, InstanceTerminationMethod::AutoScaling);
        coordinator.swap(&pending_spot(), &view).await.unwrap();
    }

    #[tokio::test]
    async fn attach_failure_terminates_the_spot_and_unwinds() {
        let mut ec2 = permissive_ec2();
        ec2.expect_terminate_instance()
            .withf(|id| id == "i-spot")
            .times(1)
            .returning(|_| Ok(()));

        let mut asg = MockAutoScalingOps::new();
        asg.expect_suspend_processes().times(1).returning(|_, _| Ok(()));
        // The deferred resume runs despite the failure.
        asg.expect_resume_processes().times(1).returning(|_, _| Ok(()));
        asg.expect_attach_instances()
            .returning(|_, _| Err(anyhow::anyhow!("attach denied")));

        let view = GroupView::new(&asg, group_with_member(2, 4), &GroupConfig::default());
        let coordinator =
            SwapCoordinator::new(&ec2, InstanceTerminationMethod::AutoScaling);
        let result = coordinator.swap(&pending_spot(), &view).await;

        assert!(matches!(result, Err(ReplacementError::Cloud(_))));
    }

    #[tokio::test]
    async fn missing_target_terminates_the_orphaned_spot() {
        let mut ec2 = MockEc2Ops::new();
        ec2.expect_describe_instance().returning(|_| Ok(None));
        ec2.expect_terminate_instance()
            .withf(|id| id == "i-spot")
            .times(1)
            .returning(|_| Ok(()));

        let asg = MockAutoScalingOps::new();
        let view = GroupView::new(&asg, group_with_member(2, 4), &GroupConfig::default());
        let coordinator =
            SwapCoordinator::new(&ec2, InstanceTerminationMethod::AutoScaling);
        let result = coordinator.swap(&pending_spot(), &view).await;

        assert!(matches!(result, Err(ReplacementError::NotEligible(_))));
    }

    #[tokio::test]
    async fn protection_lookup_failure_fails_safe() {
        let mut ec2 = MockEc2Ops::new();
        ec2.expect_describe_instance()
            .returning(|_| Ok(Some(on_demand_instance("i-od", "m5.large", "us-east-1a"))));
        ec2.expect_is_protected_from_termination()
            .returning(|_| Err(anyhow::anyhow!("describe denied")));
        ec2.expect_terminate_instance()
            .withf(|id| id == "i-spot")
            .times(1)
            .returning(|_| Ok(()));

        let asg = MockAutoScalingOps::new();
        let view = GroupView::new(&asg, group_with_member(2, 4), &GroupConfig::default());
        let coordinator =
            SwapCoordinator::new(&ec2, InstanceTerminationMethod::AutoScaling);
        let result = coordinator.swap(&pending_spot(), &view).await;

        assert!(matches!(result, Err(ReplacementError::NotEligible(_))));
    }

    #[tokio::test]
    async fn scale_in_protected_member_is_not_replaced() {
        let mut ec2 = MockEc2Ops::new();
        ec2.expect_describe_instance()
            .returning(|_| Ok(Some(target_od())));
        ec2.expect_terminate_instance().times(1).returning(|_| Ok(()));

        let asg = MockAutoScalingOps::new();
        let mut details = group_with_member(2, 4);
        details.members[0].protected_from_scale_in = true;
        let view = GroupView::new(&asg, details, &GroupConfig::default());
        let coordinator =
            SwapCoordinator::new(&ec2, InstanceTerminationMethod::AutoScaling);
        let result = coordinator.swap(&pending_spot(), &view).await;

        assert!(matches!(result, Err(ReplacementError::NotEligible(_))));
    }

    #[tokio::test]
    async fn already_spot_target_is_not_replaced_again() {
        let mut ec2 = MockEc2Ops::new();
        ec2.expect_describe_instance().returning(|_| {
            let mut instance = target_od();
            instance.lifecycle = InstanceLifecycle::Spot;
            instance.state = InstanceState::Running;
            Ok(Some(instance))
        });
        ec2.expect_terminate_instance().times(1).returning(|_| Ok(()));

        let asg = MockAutoScalingOps::new();
        let view = GroupView::new(&asg, group_with_member(2, 4), &GroupConfig::default());
        let coordinator =
            SwapCoordinator::new(&ec2, InstanceTerminationMethod::AutoScaling);
        let result = coordinator.swap(&pending_spot(), &view).await;

        assert!(matches!(result, Err(ReplacementError::NotEligible(_))));
    }

    #[tokio::test]
    async fn detach_method_detaches_then_terminates_directly() {
        let mut ec2 = permissive_ec2();
        ec2.expect_terminate_instance()
            .withf(|id| id == "i-od")
            .times(1)
            .returning(|_| Ok(()));

        let mut asg = MockAutoScalingOps::new();
        asg.expect_suspend_processes().returning(|_, _| Ok(()));
        asg.expect_resume_processes().returning(|_, _| Ok(()));
        asg.expect_attach_instances().returning(|_, _| Ok(()));
        asg.expect_describe_group().returning(|_| {
            let mut group = group_with_member(2, 4);
            group.members.push(crate::asg::GroupMember {
                instance_id: "i-spot".to_string(),
                availability_zone: "us-east-1a".to_string(),
                lifecycle_state: "InService".to_string(),
                protected_from_scale_in: false,
            });
            Ok(Some(group))
        });
        asg.expect_detach_instance()
            .withf(|_, id, decrement| id == "i-od" && *decrement)
            .times(1)
            .returning(|_, _, _| Ok(()));
        asg.expect_terminate_instance_in_group().times(0);

        let view = GroupView::new(&asg, group_with_member(2, 4), &GroupConfig::default());
        let coordinator = SwapCoordinator::new(&ec2, InstanceTerminationMethod::Detach);
        coordinator.swap(&pending_spot(), &view).await.unwrap();
    }
}
