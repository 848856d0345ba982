//! EC2 operations behind a narrow, mockable interface.
//!
//! The trait speaks the engine's domain types; all SDK request building
//! and response conversion lives in the real client below it.

use anyhow::{Context, Result};
use aws_sdk_ec2::error::ProvideErrorMetadata;
use aws_sdk_ec2::types::{
    CapacityReservationPreference, CapacityReservationTarget, DefaultTargetCapacityType,
    FleetLaunchTemplateConfigRequest, FleetLaunchTemplateOverridesRequest,
    FleetLaunchTemplateSpecificationRequest, FleetType, InstanceAttributeName,
    InstanceLifecycleType, InstanceStateName, InstanceType,
    LaunchTemplateBlockDeviceMappingRequest, LaunchTemplateCapacityReservationSpecificationRequest,
    LaunchTemplateCpuOptionsRequest, LaunchTemplateEbsBlockDeviceRequest,
    LaunchTemplateIamInstanceProfileSpecificationRequest,
    LaunchTemplateInstanceMarketOptionsRequest,
    LaunchTemplateInstanceNetworkInterfaceSpecificationRequest, LaunchTemplatePlacementRequest,
    LaunchTemplateSpotMarketOptionsRequest, LaunchTemplateTagSpecificationRequest,
    LaunchTemplatesMonitoringRequest, MarketType, RequestLaunchTemplateData, ResourceType,
    ShutdownBehavior, SpotAllocationStrategy as SdkSpotAllocationStrategy,
    TargetCapacitySpecificationRequest, VolumeType,
};
use backon::{ExponentialBuilder, Retryable};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::aws::context::AwsContext;
use crate::aws::error::{classify_aws_error, classify_anyhow_error};
use crate::fleet::{FleetLaunchError, FleetOutcome, FleetRequest};
use crate::instance::{Instance, InstanceLifecycle, InstanceState};
use crate::projection::{
    no_device_from_string, BlockDeviceSpec, CapacityReservationSpec, CpuOptionsSpec, EbsSpec,
    IamProfileSpec, LaunchTemplateSpec, NetworkInterfaceSpec, TagSpecificationSpec,
    TemplateSource,
};

/// EC2 operations the engine needs. Parameters are owned so the trait can
/// be mocked without lifetime gymnastics.
#[allow(async_fn_in_trait)]
#[cfg_attr(test, mockall::automock)]
pub trait Ec2Ops: Send + Sync {
    /// Describe one instance; `None` when it no longer exists.
    async fn describe_instance(&self, instance_id: String) -> Result<Option<Instance>>;

    /// Whether the instance has API termination protection. Lookup errors
    /// surface so callers can fail safe.
    async fn is_protected_from_termination(&self, instance_id: String) -> Result<bool>;

    /// Block-device mappings of an image.
    async fn image_block_devices(&self, image_id: String) -> Result<Vec<BlockDeviceSpec>>;

    /// A specific launch template version's data.
    async fn describe_launch_template_version(
        &self,
        template_id: String,
        version: String,
    ) -> Result<TemplateSource>;

    /// Create a launch template. Name collisions surface as errors the
    /// caller classifies; an existing template from an earlier crashed run
    /// is reused.
    async fn create_launch_template(&self, name: String, spec: LaunchTemplateSpec) -> Result<()>;

    async fn delete_launch_template(&self, name: String) -> Result<()>;

    /// Run an instant fleet request for one spot unit.
    async fn create_fleet(&self, request: FleetRequest) -> Result<FleetOutcome>;

    async fn terminate_instance(&self, instance_id: String) -> Result<()>;

    /// Delete one tag from an instance.
    async fn delete_tag(&self, instance_id: String, key: String) -> Result<()>;
}

/// Real EC2 client.
pub struct Ec2Client {
    client: aws_sdk_ec2::Client,
}

impl Ec2Client {
    pub fn from_context(ctx: &AwsContext) -> Self {
        Self {
            client: ctx.ec2_client(),
        }
    }

    async fn do_describe_instance(&self, instance_id: &str) -> Result<Option<Instance>> {
        let response = match self
            .client
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await
        {
            Ok(response) => response,
            Err(error) => {
                if classify_aws_error(error.code(), error.message()).is_not_found() {
                    return Ok(None);
                }
                return Err(anyhow::Error::from(error)).context("Failed to describe instance");
            }
        };

        let instance = response
            .reservations()
            .first()
            .and_then(|r| r.instances().first())
            .map(instance_from_sdk);
        Ok(instance)
    }
}

impl Ec2Ops for Ec2Client {
    async fn describe_instance(&self, instance_id: String) -> Result<Option<Instance>> {
        (|| async { self.do_describe_instance(&instance_id).await })
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(Duration::from_secs(1))
                    .with_max_delay(Duration::from_secs(10))
                    .with_max_times(4),
            )
            .when(|e| classify_anyhow_error(e).is_retryable())
            .notify(|error, delay| {
                warn!(?delay, %error, "Describe throttled, backing off");
            })
            .await
    }

    async fn is_protected_from_termination(&self, instance_id: String) -> Result<bool> {
        let response = self
            .client
            .describe_instance_attribute()
            .instance_id(&instance_id)
            .attribute(InstanceAttributeName::DisableApiTermination)
            .send()
            .await
            .context("Failed to describe instance attributes")?;

        Ok(response
            .disable_api_termination()
            .and_then(|attr| attr.value())
            .unwrap_or(false))
    }

    async fn image_block_devices(&self, image_id: String) -> Result<Vec<BlockDeviceSpec>> {
        let response = self
            .client
            .describe_images()
            .image_ids(&image_id)
            .send()
            .await
            .context("Failed to describe image")?;

        let Some(image) = response.images().first() else {
            warn!(%image_id, "Missing image data");
            return Ok(Vec::new());
        };

        Ok(image
            .block_device_mappings()
            .iter()
            .map(|bdm| BlockDeviceSpec {
                device_name: bdm.device_name().map(str::to_string),
                virtual_name: bdm.virtual_name().map(str::to_string),
                no_device: no_device_from_string(bdm.no_device()),
                ebs: bdm.ebs().map(|ebs| EbsSpec {
                    delete_on_termination: ebs.delete_on_termination(),
                    encrypted: ebs.encrypted(),
                    iops: ebs.iops(),
                    snapshot_id: ebs.snapshot_id().map(str::to_string),
                    volume_size: ebs.volume_size(),
                    volume_type: ebs.volume_type().map(|vt| vt.as_str().to_string()),
                }),
            })
            .collect())
    }

    async fn describe_launch_template_version(
        &self,
        template_id: String,
        version: String,
    ) -> Result<TemplateSource> {
        let response = self
            .client
            .describe_launch_template_versions()
            .launch_template_id(&template_id)
            .versions(&version)
            .send()
            .await
            .with_context(|| {
                format!("Failed to describe launch template {template_id} version {version}")
            })?;

        let versions = response.launch_template_versions();
        let data = match versions {
            [only] => only.launch_template_data(),
            _ => None,
        };
        let data = data.context("missing launch template version information")?;

        Ok(TemplateSource {
            block_device_mappings: data
                .block_device_mappings()
                .iter()
                .map(|bdm| BlockDeviceSpec {
                    device_name: bdm.device_name().map(str::to_string),
                    virtual_name: bdm.virtual_name().map(str::to_string),
                    no_device: no_device_from_string(bdm.no_device()),
                    ebs: bdm.ebs().map(|ebs| EbsSpec {
                        delete_on_termination: ebs.delete_on_termination(),
                        encrypted: ebs.encrypted(),
                        iops: ebs.iops(),
                        snapshot_id: ebs.snapshot_id().map(str::to_string),
                        volume_size: ebs.volume_size(),
                        volume_type: ebs.volume_type().map(|vt| vt.as_str().to_string()),
                    }),
                })
                .collect(),
            capacity_reservation: data.capacity_reservation_specification().map(|spec| {
                CapacityReservationSpec {
                    preference: spec
                        .capacity_reservation_preference()
                        .map(|p| p.as_str().to_string()),
                    capacity_reservation_id: spec
                        .capacity_reservation_target()
                        .and_then(|t| t.capacity_reservation_id())
                        .map(str::to_string),
                }
            }),
            cpu_options: data.cpu_options().map(|cpu| CpuOptionsSpec {
                core_count: cpu.core_count(),
                threads_per_core: cpu.threads_per_core(),
            }),
            credit_specification: data
                .credit_specification()
                .and_then(|c| c.cpu_credits())
                .map(str::to_string),
            disable_api_termination: data.disable_api_termination(),
            ebs_optimized: data.ebs_optimized(),
            iam_instance_profile: data.iam_instance_profile().and_then(|profile| {
                profile
                    .arn()
                    .map(|arn| IamProfileSpec::Arn(arn.to_string()))
                    .or_else(|| profile.name().map(|name| IamProfileSpec::Name(name.to_string())))
            }),
            image_id: data.image_id().map(str::to_string),
            instance_initiated_shutdown_behavior: data
                .instance_initiated_shutdown_behavior()
                .map(|b| b.as_str().to_string()),
            key_name: data.key_name().map(str::to_string),
            monitoring_enabled: data.monitoring().and_then(|m| m.enabled()),
            network_interfaces: data
                .network_interfaces()
                .iter()
                .map(|ni| NetworkInterfaceSpec {
                    device_index: ni.device_index().unwrap_or(0),
                    associate_public_ip_address: ni.associate_public_ip_address(),
                    subnet_id: ni.subnet_id().map(str::to_string),
                    groups: ni.groups().to_vec(),
                })
                .collect(),
            user_data: data.user_data().map(str::to_string),
            tag_specifications: data
                .tag_specifications()
                .iter()
                .map(|ts| TagSpecificationSpec {
                    resource_type: ts
                        .resource_type()
                        .map(|rt| rt.as_str().to_string())
                        .unwrap_or_default(),
                    tags: ts
                        .tags()
                        .iter()
                        .filter_map(|t| Some((t.key()?.to_string(), t.value()?.to_string())))
                        .collect(),
                })
                .collect(),
            security_group_ids: data.security_group_ids().to_vec(),
            security_groups: data.security_groups().to_vec(),
        })
    }

    async fn create_launch_template(&self, name: String, spec: LaunchTemplateSpec) -> Result<()> {
        self.client
            .create_launch_template()
            .launch_template_name(&name)
            .launch_template_data(launch_template_data_to_sdk(&spec))
            .send()
            .await
            .with_context(|| format!("Failed to create launch template {name}"))?;

        debug!(template = %name, "Created temporary launch template");
        Ok(())
    }

    async fn delete_launch_template(&self, name: String) -> Result<()> {
        self.client
            .delete_launch_template()
            .launch_template_name(&name)
            .send()
            .await
            .with_context(|| format!("Failed to delete launch template {name}"))?;
        Ok(())
    }

    async fn create_fleet(&self, request: FleetRequest) -> Result<FleetOutcome> {
        let overrides: Vec<FleetLaunchTemplateOverridesRequest> = request
            .overrides
            .iter()
            .map(|o| {
                let mut builder = FleetLaunchTemplateOverridesRequest::builder()
                    .instance_type(InstanceType::from(o.instance_type.as_str()));
                if let Some(subnet) = &o.subnet_id {
                    builder = builder.subnet_id(subnet);
                }
                if let Some(priority) = o.priority {
                    builder = builder.priority(priority);
                }
                builder.build()
            })
            .collect();

        let template_config = FleetLaunchTemplateConfigRequest::builder()
            .launch_template_specification(
                FleetLaunchTemplateSpecificationRequest::builder()
                    .launch_template_name(&request.template_name)
                    .version("$Latest")
                    .build(),
            )
            .set_overrides(Some(overrides))
            .build();

        let response = self
            .client
            .create_fleet()
            .r#type(FleetType::Instant)
            .launch_template_configs(template_config)
            .target_capacity_specification(
                TargetCapacitySpecificationRequest::builder()
                    .total_target_capacity(1)
                    .spot_target_capacity(1)
                    .default_target_capacity_type(DefaultTargetCapacityType::Spot)
                    .build(),
            )
            .spot_options(
                aws_sdk_ec2::types::SpotOptionsRequest::builder()
                    .allocation_strategy(SdkSpotAllocationStrategy::from(
                        request.allocation_strategy.as_str(),
                    ))
                    .build(),
            )
            .send()
            .await
            .context("CreateFleet failed")?;

        let instance_ids: Vec<String> = response
            .instances()
            .iter()
            .flat_map(|fleet_instance| fleet_instance.instance_ids().iter().cloned())
            .collect();

        let errors: Vec<FleetLaunchError> = response
            .errors()
            .iter()
            .map(|e| FleetLaunchError {
                code: e.error_code().unwrap_or_default().to_string(),
                message: e.error_message().unwrap_or_default().to_string(),
            })
            .collect();

        Ok(FleetOutcome {
            instance_ids,
            errors,
        })
    }

    async fn terminate_instance(&self, instance_id: String) -> Result<()> {
        info!(instance_id = %instance_id, "Terminating instance");

        self.client
            .terminate_instances()
            .instance_ids(&instance_id)
            .send()
            .await
            .context("Failed to terminate instance")?;
        Ok(())
    }

    async fn delete_tag(&self, instance_id: String, key: String) -> Result<()> {
        self.client
            .delete_tags()
            .resources(&instance_id)
            .tags(aws_sdk_ec2::types::Tag::builder().key(&key).build())
            .send()
            .await
            .with_context(|| format!("Failed to delete tag {key} from {instance_id}"))?;
        Ok(())
    }
}

/// Reduce an SDK instance description to the engine's domain model.
pub(crate) fn instance_from_sdk(sdk: &aws_sdk_ec2::types::Instance) -> Instance {
    Instance {
        id: sdk.instance_id().unwrap_or_default().to_string(),
        lifecycle: if sdk.instance_lifecycle() == Some(&InstanceLifecycleType::Spot) {
            InstanceLifecycle::Spot
        } else {
            InstanceLifecycle::OnDemand
        },
        state: state_from_sdk(sdk.state().and_then(|s| s.name())),
        availability_zone: sdk
            .placement()
            .and_then(|p| p.availability_zone())
            .unwrap_or_default()
            .to_string(),
        subnet_id: sdk.subnet_id().map(str::to_string),
        security_group_ids: sdk
            .security_groups()
            .iter()
            .filter_map(|g| g.group_id())
            .map(str::to_string)
            .collect(),
        image_id: sdk.image_id().map(str::to_string),
        ebs_optimized: sdk.ebs_optimized().unwrap_or(false),
        virtualization_type: sdk
            .virtualization_type()
            .map(|v| v.as_str().to_string())
            .unwrap_or_else(|| "hvm".to_string()),
        instance_type: sdk
            .instance_type()
            .map(|t| t.as_str().to_string())
            .unwrap_or_default(),
        launch_time: sdk
            .launch_time()
            .and_then(|dt| chrono::DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())),
        tags: sdk
            .tags()
            .iter()
            .filter_map(|t| Some((t.key()?.to_string(), t.value()?.to_string())))
            .collect(),
    }
}

fn state_from_sdk(state: Option<&InstanceStateName>) -> InstanceState {
    match state {
        Some(InstanceStateName::Pending) | None => InstanceState::Pending,
        Some(InstanceStateName::Running) => InstanceState::Running,
        Some(InstanceStateName::ShuttingDown) => InstanceState::ShuttingDown,
        Some(InstanceStateName::Stopping) => InstanceState::Stopping,
        Some(InstanceStateName::Stopped) => InstanceState::Stopped,
        Some(InstanceStateName::Terminated) => InstanceState::Terminated,
        Some(_) => InstanceState::Other,
    }
}

/// Build the SDK launch-template data from the projected spec.
fn launch_template_data_to_sdk(spec: &LaunchTemplateSpec) -> RequestLaunchTemplateData {
    let mut builder = RequestLaunchTemplateData::builder()
        .set_image_id(spec.image_id.clone())
        .set_key_name(spec.key_name.clone())
        .set_user_data(spec.user_data.clone())
        .set_ebs_optimized(spec.ebs_optimized)
        .set_disable_api_termination(spec.disable_api_termination)
        .set_credit_specification(spec.credit_specification.as_deref().map(|credits| {
            aws_sdk_ec2::types::CreditSpecificationRequest::builder()
                .cpu_credits(credits)
                .build()
        }));

    if let Some(behavior) = spec.instance_initiated_shutdown_behavior.as_deref() {
        builder = builder.instance_initiated_shutdown_behavior(ShutdownBehavior::from(behavior));
    }
    if let Some(profile) = &spec.iam_instance_profile {
        let profile_spec = match profile {
            IamProfileSpec::Arn(arn) => {
                LaunchTemplateIamInstanceProfileSpecificationRequest::builder()
                    .arn(arn)
                    .build()
            }
            IamProfileSpec::Name(name) => {
                LaunchTemplateIamInstanceProfileSpecificationRequest::builder()
                    .name(name)
                    .build()
            }
        };
        builder = builder.iam_instance_profile(profile_spec);
    }
    if let Some(enabled) = spec.monitoring_enabled {
        builder = builder.monitoring(
            LaunchTemplatesMonitoringRequest::builder()
                .enabled(enabled)
                .build(),
        );
    }
    if let Some(cpu) = &spec.cpu_options {
        builder = builder.cpu_options(
            LaunchTemplateCpuOptionsRequest::builder()
                .set_core_count(cpu.core_count)
                .set_threads_per_core(cpu.threads_per_core)
                .build(),
        );
    }
    if let Some(reservation) = &spec.capacity_reservation {
        let mut reservation_builder =
            LaunchTemplateCapacityReservationSpecificationRequest::builder();
        if let Some(preference) = reservation.preference.as_deref() {
            reservation_builder = reservation_builder
                .capacity_reservation_preference(CapacityReservationPreference::from(preference));
        }
        if let Some(id) = reservation.capacity_reservation_id.as_deref() {
            reservation_builder = reservation_builder.capacity_reservation_target(
                CapacityReservationTarget::builder()
                    .capacity_reservation_id(id)
                    .build(),
            );
        }
        builder = builder.capacity_reservation_specification(reservation_builder.build());
    }

    if !spec.block_device_mappings.is_empty() {
        let mappings: Vec<LaunchTemplateBlockDeviceMappingRequest> = spec
            .block_device_mappings
            .iter()
            .map(|bdm| {
                let mut mapping = LaunchTemplateBlockDeviceMappingRequest::builder()
                    .set_device_name(bdm.device_name.clone())
                    .set_virtual_name(bdm.virtual_name.clone());
                if let Some(ebs) = &bdm.ebs {
                    let mut ebs_builder = LaunchTemplateEbsBlockDeviceRequest::builder()
                        .set_delete_on_termination(ebs.delete_on_termination)
                        .set_encrypted(ebs.encrypted)
                        .set_iops(ebs.iops)
                        .set_snapshot_id(ebs.snapshot_id.clone())
                        .set_volume_size(ebs.volume_size);
                    if let Some(volume_type) = ebs.volume_type.as_deref() {
                        ebs_builder = ebs_builder.volume_type(VolumeType::from(volume_type));
                    }
                    mapping = mapping.ebs(ebs_builder.build());
                }
                mapping.build()
            })
            .collect();
        builder = builder.set_block_device_mappings(Some(mappings));
    }

    if !spec.network_interfaces.is_empty() {
        let interfaces: Vec<LaunchTemplateInstanceNetworkInterfaceSpecificationRequest> = spec
            .network_interfaces
            .iter()
            .map(|ni| {
                LaunchTemplateInstanceNetworkInterfaceSpecificationRequest::builder()
                    .device_index(ni.device_index)
                    .set_associate_public_ip_address(ni.associate_public_ip_address)
                    .set_subnet_id(ni.subnet_id.clone())
                    .set_groups(if ni.groups.is_empty() {
                        None
                    } else {
                        Some(ni.groups.clone())
                    })
                    .build()
            })
            .collect();
        builder = builder.set_network_interfaces(Some(interfaces));
    } else {
        if !spec.security_group_ids.is_empty() {
            builder = builder.set_security_group_ids(Some(spec.security_group_ids.clone()));
        }
        if !spec.security_groups.is_empty() {
            builder = builder.set_security_groups(Some(spec.security_groups.clone()));
        }
    }

    if let Some(zone) = spec.availability_zone.as_deref() {
        builder = builder.placement(
            LaunchTemplatePlacementRequest::builder()
                .availability_zone(zone)
                .build(),
        );
    }

    builder = builder.instance_market_options(
        LaunchTemplateInstanceMarketOptionsRequest::builder()
            .market_type(MarketType::Spot)
            .spot_options(
                LaunchTemplateSpotMarketOptionsRequest::builder()
                    .max_price(&spec.max_price)
                    .build(),
            )
            .build(),
    );

    if !spec.tag_specifications.is_empty() {
        let tag_specs: Vec<LaunchTemplateTagSpecificationRequest> = spec
            .tag_specifications
            .iter()
            .map(|ts| {
                let tags: Vec<aws_sdk_ec2::types::Tag> = ts
                    .tags
                    .iter()
                    .map(|(key, value)| {
                        aws_sdk_ec2::types::Tag::builder()
                            .key(key)
                            .value(value)
                            .build()
                    })
                    .collect();
                LaunchTemplateTagSpecificationRequest::builder()
                    .resource_type(ResourceType::from(ts.resource_type.as_str()))
                    .set_tags(Some(tags))
                    .build()
            })
            .collect();
        builder = builder.set_tag_specifications(Some(tag_specs));
    }

    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sdk_instance_converts_to_domain() {
        let sdk = aws_sdk_ec2::types::Instance::builder()
            .instance_id("i-123")
            .instance_lifecycle(InstanceLifecycleType::Spot)
            .state(
                aws_sdk_ec2::types::InstanceState::builder()
                    .name(InstanceStateName::Running)
                    .build(),
            )
            .placement(
                aws_sdk_ec2::types::Placement::builder()
                    .availability_zone("us-east-1a")
                    .build(),
            )
            .subnet_id("subnet-1")
            .security_groups(
                aws_sdk_ec2::types::GroupIdentifier::builder()
                    .group_id("sg-1")
                    .build(),
            )
            .ebs_optimized(true)
            .instance_type(InstanceType::from("m5.large"))
            .tags(
                aws_sdk_ec2::types::Tag::builder()
                    .key("launched-for-asg")
                    .value("g1")
                    .build(),
            )
            .build();

        let instance = instance_from_sdk(&sdk);
        assert_eq!(instance.id, "i-123");
        assert!(instance.is_spot());
        assert_eq!(instance.state, InstanceState::Running);
        assert_eq!(instance.availability_zone, "us-east-1a");
        assert_eq!(instance.security_group_ids, ["sg-1"]);
        assert!(instance.ebs_optimized);
        assert_eq!(instance.instance_type, "m5.large");
        assert_eq!(instance.replacement_target_group(), Some("g1"));
    }

    #[test]
    fn market_options_always_request_spot() {
        let spec = LaunchTemplateSpec {
            max_price: "0.096".to_string(),
            ..Default::default()
        };
        let data = launch_template_data_to_sdk(&spec);
        let market = data.instance_market_options().unwrap();
        assert_eq!(market.market_type(), Some(&MarketType::Spot));
        assert_eq!(
            market.spot_options().and_then(|o| o.max_price()),
            Some("0.096")
        );
    }

    #[test]
    fn network_interfaces_exclude_top_level_groups() {
        let spec = LaunchTemplateSpec {
            network_interfaces: vec![NetworkInterfaceSpec {
                device_index: 0,
                associate_public_ip_address: Some(true),
                subnet_id: Some("subnet-1".to_string()),
                groups: vec!["sg-1".to_string()],
            }],
            // Populated but must not be emitted alongside interfaces.
            security_group_ids: vec!["sg-stale".to_string()],
            max_price: "0.1".to_string(),
            ..Default::default()
        };
        let data = launch_template_data_to_sdk(&spec);
        assert_eq!(data.network_interfaces().len(), 1);
        assert!(data.security_group_ids().is_empty());
    }
}
