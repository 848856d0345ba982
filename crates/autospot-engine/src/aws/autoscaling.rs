//! Auto-scaling operations behind a narrow, mockable interface.

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::asg::{GroupDetails, GroupMember};
use crate::aws::context::AwsContext;
use crate::projection::{
    no_device_from_bool, BlockDeviceSpec, EbsSpec, LaunchConfigSource, TemplateRef,
};

/// Auto-scaling operations the engine needs.
#[allow(async_fn_in_trait)]
#[cfg_attr(test, mockall::automock)]
pub trait AutoScalingOps: Send + Sync {
    /// Describe one group; `None` when it does not exist.
    async fn describe_group(&self, name: String) -> Result<Option<GroupDetails>>;

    /// All groups in the region.
    async fn describe_all_groups(&self) -> Result<Vec<GroupDetails>>;

    /// The group an instance belongs to, if any.
    async fn group_name_for_instance(&self, instance_id: String) -> Result<Option<String>>;

    /// The launch configuration a group provisions from, if it uses one.
    async fn describe_launch_configuration(
        &self,
        name: String,
    ) -> Result<Option<LaunchConfigSource>>;

    /// Lifecycle transitions of the group's hooks.
    async fn lifecycle_hook_transitions(&self, group: String) -> Result<Vec<String>>;

    async fn attach_instances(&self, group: String, instance_ids: Vec<String>) -> Result<()>;

    async fn detach_instance(
        &self,
        group: String,
        instance_id: String,
        decrement_desired: bool,
    ) -> Result<()>;

    /// Remove a member through the group, honouring lifecycle hooks.
    async fn terminate_instance_in_group(
        &self,
        instance_id: String,
        decrement_desired: bool,
    ) -> Result<()>;

    async fn set_max_size(&self, group: String, max_size: i32) -> Result<()>;

    async fn suspend_processes(&self, group: String, processes: Vec<String>) -> Result<()>;

    async fn resume_processes(&self, group: String, processes: Vec<String>) -> Result<()>;
}

/// Real auto-scaling client.
pub struct AutoScalingClient {
    client: aws_sdk_autoscaling::Client,
}

impl AutoScalingClient {
    pub fn from_context(ctx: &AwsContext) -> Self {
        Self {
            client: ctx.autoscaling_client(),
        }
    }
}

impl AutoScalingOps for AutoScalingClient {
    async fn describe_group(&self, name: String) -> Result<Option<GroupDetails>> {
        let response = self
            .client
            .describe_auto_scaling_groups()
            .auto_scaling_group_names(&name)
            .send()
            .await
            .with_context(|| format!("Failed to describe auto-scaling group {name}"))?;

        Ok(response.auto_scaling_groups().first().map(group_from_sdk))
    }

    async fn describe_all_groups(&self) -> Result<Vec<GroupDetails>> {
        let mut groups = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let mut request = self.client.describe_auto_scaling_groups();
            if let Some(token) = &next_token {
                request = request.next_token(token);
            }
            let response = request
                .send()
                .await
                .context("Failed to describe auto-scaling groups")?;

            groups.extend(response.auto_scaling_groups().iter().map(group_from_sdk));

            next_token = response.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }

        debug!(count = groups.len(), "Described auto-scaling groups");
        Ok(groups)
    }

    async fn group_name_for_instance(&self, instance_id: String) -> Result<Option<String>> {
        let response = self
            .client
            .describe_auto_scaling_instances()
            .instance_ids(&instance_id)
            .send()
            .await
            .with_context(|| format!("Failed to describe auto-scaling instance {instance_id}"))?;

        Ok(response
            .auto_scaling_instances()
            .first()
            .and_then(|i| i.auto_scaling_group_name())
            .map(str::to_string))
    }

    async fn describe_launch_configuration(
        &self,
        name: String,
    ) -> Result<Option<LaunchConfigSource>> {
        let response = self
            .client
            .describe_launch_configurations()
            .launch_configuration_names(&name)
            .send()
            .await
            .with_context(|| format!("Failed to describe launch configuration {name}"))?;

        Ok(response
            .launch_configurations()
            .first()
            .map(launch_configuration_from_sdk))
    }

    async fn lifecycle_hook_transitions(&self, group: String) -> Result<Vec<String>> {
        let response = self
            .client
            .describe_lifecycle_hooks()
            .auto_scaling_group_name(&group)
            .send()
            .await
            .with_context(|| format!("Failed to describe lifecycle hooks of {group}"))?;

        Ok(response
            .lifecycle_hooks()
            .iter()
            .filter_map(|hook| hook.lifecycle_transition())
            .map(str::to_string)
            .collect())
    }

    async fn attach_instances(&self, group: String, instance_ids: Vec<String>) -> Result<()> {
        info!(group = %group, instances = ?instance_ids, "Attaching instances");

        self.client
            .attach_instances()
            .auto_scaling_group_name(&group)
            .set_instance_ids(Some(instance_ids))
            .send()
            .await
            .with_context(|| format!("Failed to attach instances to {group}"))?;
        Ok(())
    }

    async fn detach_instance(
        &self,
        group: String,
        instance_id: String,
        decrement_desired: bool,
    ) -> Result<()> {
        info!(group = %group, instance_id = %instance_id, "Detaching instance");

        self.client
            .detach_instances()
            .auto_scaling_group_name(&group)
            .instance_ids(&instance_id)
            .should_decrement_desired_capacity(decrement_desired)
            .send()
            .await
            .with_context(|| format!("Failed to detach {instance_id} from {group}"))?;
        Ok(())
    }

    async fn terminate_instance_in_group(
        &self,
        instance_id: String,
        decrement_desired: bool,
    ) -> Result<()> {
        info!(instance_id = %instance_id, decrement_desired, "Terminating instance in group");

        self.client
            .terminate_instance_in_auto_scaling_group()
            .instance_id(&instance_id)
            .should_decrement_desired_capacity(decrement_desired)
            .send()
            .await
            .with_context(|| format!("Failed to terminate {instance_id} in its group"))?;
        Ok(())
    }

    async fn set_max_size(&self, group: String, max_size: i32) -> Result<()> {
        info!(group = %group, max_size, "Updating group MaxSize");

        self.client
            .update_auto_scaling_group()
            .auto_scaling_group_name(&group)
            .max_size(max_size)
            .send()
            .await
            .with_context(|| format!("Failed to update MaxSize of {group}"))?;
        Ok(())
    }

    async fn suspend_processes(&self, group: String, processes: Vec<String>) -> Result<()> {
        info!(group = %group, ?processes, "Suspending group processes");

        self.client
            .suspend_processes()
            .auto_scaling_group_name(&group)
            .set_scaling_processes(Some(processes))
            .send()
            .await
            .with_context(|| format!("Failed to suspend processes of {group}"))?;
        Ok(())
    }

    async fn resume_processes(&self, group: String, processes: Vec<String>) -> Result<()> {
        info!(group = %group, ?processes, "Resuming group processes");

        self.client
            .resume_processes()
            .auto_scaling_group_name(&group)
            .set_scaling_processes(Some(processes))
            .send()
            .await
            .with_context(|| format!("Failed to resume processes of {group}"))?;
        Ok(())
    }
}

fn group_from_sdk(sdk: &aws_sdk_autoscaling::types::AutoScalingGroup) -> GroupDetails {
    GroupDetails {
        name: sdk.auto_scaling_group_name().unwrap_or_default().to_string(),
        min_size: sdk.min_size().unwrap_or(0),
        max_size: sdk.max_size().unwrap_or(0),
        desired_capacity: sdk.desired_capacity().unwrap_or(0),
        health_check_grace_period: sdk.health_check_grace_period().unwrap_or(0) as i64,
        launch_template: sdk.launch_template().and_then(|lt| {
            Some(TemplateRef {
                id: lt.launch_template_id()?.to_string(),
                version: lt.version().unwrap_or("$Default").to_string(),
            })
        }),
        launch_configuration_name: sdk.launch_configuration_name().map(str::to_string),
        suspended_processes: sdk
            .suspended_processes()
            .iter()
            .filter_map(|p| p.process_name())
            .map(str::to_string)
            .collect(),
        tags: sdk
            .tags()
            .iter()
            .filter_map(|t| Some((t.key()?.to_string(), t.value()?.to_string())))
            .collect(),
        members: sdk
            .instances()
            .iter()
            .map(|i| GroupMember {
                instance_id: i.instance_id().unwrap_or_default().to_string(),
                availability_zone: i.availability_zone().unwrap_or_default().to_string(),
                lifecycle_state: i
                    .lifecycle_state()
                    .map(|s| s.as_str().to_string())
                    .unwrap_or_default(),
                protected_from_scale_in: i.protected_from_scale_in().unwrap_or(false),
            })
            .collect(),
    }
}

fn launch_configuration_from_sdk(
    sdk: &aws_sdk_autoscaling::types::LaunchConfiguration,
) -> LaunchConfigSource {
    let block_device_mappings: Vec<BlockDeviceSpec> = sdk
        .block_device_mappings()
        .iter()
        .map(|bdm| BlockDeviceSpec {
            device_name: bdm.device_name().map(str::to_string),
            virtual_name: bdm.virtual_name().map(str::to_string),
            no_device: no_device_from_bool(bdm.no_device()),
            ebs: bdm.ebs().map(|ebs| EbsSpec {
                delete_on_termination: ebs.delete_on_termination(),
                encrypted: ebs.encrypted(),
                iops: ebs.iops(),
                snapshot_id: ebs.snapshot_id().map(str::to_string),
                volume_size: ebs.volume_size(),
                volume_type: ebs.volume_type().map(str::to_string),
            }),
        })
        .collect();

    let ephemeral_device_count = block_device_mappings
        .iter()
        .filter(|bdm| {
            bdm.virtual_name
                .as_deref()
                .is_some_and(|name| name.starts_with("ephemeral"))
        })
        .count() as u32;

    LaunchConfigSource {
        key_name: sdk.key_name().map(str::to_string),
        iam_instance_profile: sdk.iam_instance_profile().map(str::to_string),
        image_id: sdk.image_id().map(str::to_string),
        user_data: sdk.user_data().map(str::to_string),
        block_device_mappings,
        monitoring_enabled: sdk.instance_monitoring().and_then(|m| m.enabled()),
        associate_public_ip_address: sdk.associate_public_ip_address(),
        ephemeral_device_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_conversion_keeps_capacity_and_members() {
        let sdk = aws_sdk_autoscaling::types::AutoScalingGroup::builder()
            .auto_scaling_group_name("g1")
            .min_size(1)
            .max_size(4)
            .desired_capacity(2)
            .health_check_grace_period(300)
            .launch_configuration_name("lc-1")
            .instances(
                aws_sdk_autoscaling::types::Instance::builder()
                    .instance_id("i-1")
                    .availability_zone("us-east-1a")
                    .lifecycle_state(aws_sdk_autoscaling::types::LifecycleState::InService)
                    .protected_from_scale_in(true)
                    .build(),
            )
            .tags(
                aws_sdk_autoscaling::types::TagDescription::builder()
                    .key("spot-enabled")
                    .value("true")
                    .build(),
            )
            .build();

        let group = group_from_sdk(&sdk);
        assert_eq!(group.name, "g1");
        assert_eq!(group.desired_capacity, 2);
        assert_eq!(group.max_size, 4);
        assert_eq!(group.health_check_grace_period, 300);
        assert_eq!(group.launch_configuration_name.as_deref(), Some("lc-1"));
        assert_eq!(group.members.len(), 1);
        assert!(group.members[0].protected_from_scale_in);
        assert_eq!(group.tags.get("spot-enabled").map(String::as_str), Some("true"));
    }

    #[test]
    fn launch_configuration_counts_ephemeral_mappings() {
        let sdk = aws_sdk_autoscaling::types::LaunchConfiguration::builder()
            .launch_configuration_name("lc-1")
            .image_id("ami-1")
            .block_device_mappings(
                aws_sdk_autoscaling::types::BlockDeviceMapping::builder()
                    .device_name("/dev/sdb")
                    .virtual_name("ephemeral0")
                    .build(),
            )
            .block_device_mappings(
                aws_sdk_autoscaling::types::BlockDeviceMapping::builder()
                    .device_name("/dev/sdc")
                    .virtual_name("ephemeral1")
                    .build(),
            )
            .block_device_mappings(
                aws_sdk_autoscaling::types::BlockDeviceMapping::builder()
                    .device_name("/dev/xvda")
                    .ebs(
                        aws_sdk_autoscaling::types::Ebs::builder()
                            .volume_size(50)
                            .volume_type("gp2")
                            .build(),
                    )
                    .build(),
            )
            .build();

        let source = launch_configuration_from_sdk(&sdk);
        assert_eq!(source.ephemeral_device_count, 2);
        assert_eq!(source.block_device_mappings.len(), 3);
    }
}
