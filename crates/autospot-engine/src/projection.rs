//! Launch-template projection: clones a running instance's effective
//! configuration into the launch-template data used by the fleet request.
//!
//! Three sources merge in a fixed order: the image's block devices, the
//! group's launch template (when it uses one) and the group's launch
//! configuration (when it uses one). The projection is pure; fetching the
//! sources is the caller's job.

use tracing::debug;

use autospot_common::tags::{
    self, LAUNCHED_BY_TAG, LAUNCHED_FOR_ASG_TAG, LAUNCHED_FOR_REPLACING_TAG,
    LAUNCH_CONFIGURATION_NAME_TAG, LAUNCH_TEMPLATE_ID_TAG, LAUNCH_TEMPLATE_VERSION_TAG,
};

use crate::instance::Instance;

/// Regions where io2 volumes are not available; io1 stays io1 there.
const UNSUPPORTED_IO2_REGIONS: [&str; 9] = [
    "us-gov-west-1",
    "us-gov-east-1",
    "sa-east-1",
    "cn-north-1",
    "cn-northwest-1",
    "eu-south-1",
    "af-south-1",
    "eu-west-3",
    "ap-northeast-3",
];

/// EBS attributes of a block-device mapping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EbsSpec {
    pub delete_on_termination: Option<bool>,
    pub encrypted: Option<bool>,
    pub iops: Option<i32>,
    pub snapshot_id: Option<String>,
    pub volume_size: Option<i32>,
    pub volume_type: Option<String>,
}

/// One block-device mapping from any of the three sources.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockDeviceSpec {
    pub device_name: Option<String>,
    pub virtual_name: Option<String>,
    /// Suppressed mapping; dropped during conversion.
    pub no_device: bool,
    pub ebs: Option<EbsSpec>,
}

/// Network interface emitted on the projected template.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkInterfaceSpec {
    pub device_index: i32,
    pub associate_public_ip_address: Option<bool>,
    pub subnet_id: Option<String>,
    pub groups: Vec<String>,
}

/// IAM instance profile reference, by ARN or by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IamProfileSpec {
    Arn(String),
    Name(String),
}

impl IamProfileSpec {
    /// Launch configurations store a single string; the `arn:aws:iam:`
    /// prefix tells the two apart.
    pub fn from_launch_configuration(value: &str) -> Self {
        if value.starts_with("arn:aws:iam:") {
            IamProfileSpec::Arn(value.to_string())
        } else {
            IamProfileSpec::Name(value.to_string())
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapacityReservationSpec {
    pub preference: Option<String>,
    pub capacity_reservation_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpuOptionsSpec {
    pub core_count: Option<i32>,
    pub threads_per_core: Option<i32>,
}

/// A tag specification scoped to one resource type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagSpecificationSpec {
    pub resource_type: String,
    pub tags: Vec<(String, String)>,
}

/// Copyable fields of a described launch-template version.
#[derive(Debug, Clone, Default)]
pub struct TemplateSource {
    pub block_device_mappings: Vec<BlockDeviceSpec>,
    pub capacity_reservation: Option<CapacityReservationSpec>,
    pub cpu_options: Option<CpuOptionsSpec>,
    pub credit_specification: Option<String>,
    pub disable_api_termination: Option<bool>,
    pub ebs_optimized: Option<bool>,
    pub iam_instance_profile: Option<IamProfileSpec>,
    pub image_id: Option<String>,
    pub instance_initiated_shutdown_behavior: Option<String>,
    pub key_name: Option<String>,
    pub monitoring_enabled: Option<bool>,
    pub network_interfaces: Vec<NetworkInterfaceSpec>,
    pub user_data: Option<String>,
    pub tag_specifications: Vec<TagSpecificationSpec>,
    pub security_group_ids: Vec<String>,
    pub security_groups: Vec<String>,
}

/// Copyable fields of a described launch configuration.
#[derive(Debug, Clone, Default)]
pub struct LaunchConfigSource {
    pub key_name: Option<String>,
    pub iam_instance_profile: Option<String>,
    pub image_id: Option<String>,
    pub user_data: Option<String>,
    pub block_device_mappings: Vec<BlockDeviceSpec>,
    pub monitoring_enabled: Option<bool>,
    pub associate_public_ip_address: Option<bool>,
    /// Number of ephemeral (instance-store) mappings the configuration
    /// defines, used by the storage compatibility predicate.
    pub ephemeral_device_count: u32,
}

/// The synthesized launch-template data for the spot fleet.
#[derive(Debug, Clone, Default)]
pub struct LaunchTemplateSpec {
    pub image_id: Option<String>,
    pub key_name: Option<String>,
    pub user_data: Option<String>,
    pub iam_instance_profile: Option<IamProfileSpec>,
    pub ebs_optimized: Option<bool>,
    pub monitoring_enabled: Option<bool>,
    pub disable_api_termination: Option<bool>,
    pub instance_initiated_shutdown_behavior: Option<String>,
    pub capacity_reservation: Option<CapacityReservationSpec>,
    pub cpu_options: Option<CpuOptionsSpec>,
    pub credit_specification: Option<String>,
    pub block_device_mappings: Vec<BlockDeviceSpec>,
    pub network_interfaces: Vec<NetworkInterfaceSpec>,
    pub security_group_ids: Vec<String>,
    pub security_groups: Vec<String>,
    pub availability_zone: Option<String>,
    /// Spot bid, preformatted for the market options.
    pub max_price: String,
    pub tag_specifications: Vec<TagSpecificationSpec>,
}

/// Reference to the launch template a group uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateRef {
    pub id: String,
    pub version: String,
}

/// Normalize the boolean `NoDevice` form used by launch configurations.
pub fn no_device_from_bool(flag: Option<bool>) -> bool {
    flag.unwrap_or(false)
}

/// Normalize the string `NoDevice` form used by templates and images.
pub fn no_device_from_string(flag: Option<&str>) -> bool {
    flag == Some("true")
}

/// Volume-type rewrites applied to every projected EBS mapping: io1 becomes
/// io2 outside the regions that lack it, and gp2 becomes gp3 up to the size
/// threshold where gp2 starts outperforming a baseline gp3 volume.
fn convert_volume_type(
    volume_type: &str,
    volume_size: Option<i32>,
    region: &str,
    gp2_threshold: i32,
) -> String {
    if volume_type == "io1" && !UNSUPPORTED_IO2_REGIONS.contains(&region) {
        debug!(region, "Converting io1 volume to io2");
        return "io2".to_string();
    }
    if volume_type == "gp2" && volume_size.unwrap_or(0) <= gp2_threshold {
        debug!(region, "Converting gp2 volume to gp3");
        return "gp3".to_string();
    }
    volume_type.to_string()
}

/// Converts source block devices for the projected template: suppressed
/// mappings are dropped and volume types rewritten.
pub fn convert_block_devices(
    mappings: &[BlockDeviceSpec],
    region: &str,
    gp2_threshold: i32,
) -> Vec<BlockDeviceSpec> {
    mappings
        .iter()
        .filter(|bdm| !bdm.no_device)
        .map(|bdm| {
            let mut converted = bdm.clone();
            if let Some(ebs) = converted.ebs.as_mut() {
                if let Some(vt) = ebs.volume_type.as_deref() {
                    ebs.volume_type =
                        Some(convert_volume_type(vt, ebs.volume_size, region, gp2_threshold));
                }
            }
            converted
        })
        .collect()
}

/// Formats a bid as a general-notation float with 10 significant digits,
/// matching the wire format the market options expect.
pub fn format_max_price(price: f64) -> String {
    if price == 0.0 {
        return "0".to_string();
    }
    let exponent = price.abs().log10().floor() as i32;
    if (-4..10).contains(&exponent) {
        let decimals = (9 - exponent).max(0) as usize;
        let fixed = format!("{price:.decimals$}");
        let trimmed = fixed.trim_end_matches('0').trim_end_matches('.');
        trimmed.to_string()
    } else {
        format!("{price:.9e}")
    }
}

/// Inputs for one projection run.
pub struct ConfigProjector<'a> {
    pub region: &'a str,
    pub group_name: &'a str,
    pub launch_template: Option<&'a TemplateRef>,
    pub launch_configuration_name: Option<&'a str>,
    pub gp2_conversion_threshold: i32,
    pub patch_beanstalk_userdata: bool,
}

impl ConfigProjector<'_> {
    /// Merge the available sources into the launch-template data. Security
    /// groups are seeded first because the network-interface rule of either
    /// source path reverts them.
    pub fn assemble(
        &self,
        reference: &Instance,
        image_block_devices: &[BlockDeviceSpec],
        template: Option<&TemplateSource>,
        launch_config: Option<&LaunchConfigSource>,
        bid_price: f64,
    ) -> LaunchTemplateSpec {
        let mut spec = LaunchTemplateSpec {
            security_group_ids: reference.security_group_ids.clone(),
            block_device_mappings: self.convert(image_block_devices),
            ..Default::default()
        };

        if let Some(source) = template {
            self.apply_template(&mut spec, reference, source);
        }
        if let Some(source) = launch_config {
            self.apply_launch_configuration(&mut spec, reference, source);
        }

        spec.ebs_optimized = Some(reference.ebs_optimized);
        spec.availability_zone = Some(reference.availability_zone.clone());
        spec.max_price = format_max_price(bid_price);

        let mut tag_specs = vec![self.identifying_tags(reference)];
        if let Some(source) = template {
            tag_specs.extend(
                source
                    .tag_specifications
                    .iter()
                    .filter(|ts| ts.resource_type != "instance")
                    .cloned(),
            );
        }
        spec.tag_specifications = tag_specs;

        spec
    }

    fn convert(&self, mappings: &[BlockDeviceSpec]) -> Vec<BlockDeviceSpec> {
        convert_block_devices(mappings, self.region, self.gp2_conversion_threshold)
    }

    fn apply_template(
        &self,
        spec: &mut LaunchTemplateSpec,
        reference: &Instance,
        source: &TemplateSource,
    ) {
        spec.block_device_mappings = self.convert(&source.block_device_mappings);
        spec.capacity_reservation = source.capacity_reservation.clone();
        spec.cpu_options = source.cpu_options.clone();
        spec.credit_specification = source.credit_specification.clone();
        spec.disable_api_termination = source.disable_api_termination;
        spec.ebs_optimized = source.ebs_optimized;
        spec.iam_instance_profile = source.iam_instance_profile.clone();
        spec.image_id = source.image_id.clone();
        spec.instance_initiated_shutdown_behavior =
            source.instance_initiated_shutdown_behavior.clone();
        spec.key_name = source.key_name.clone();
        spec.monitoring_enabled = source.monitoring_enabled;
        spec.user_data = source.user_data.as_deref().map(|ud| self.user_data(ud));

        if let Some(first) = source.network_interfaces.first() {
            // The template defines its own networking; a single interface on
            // the reference's subnet replaces the top-level security groups,
            // since the two are mutually exclusive.
            spec.network_interfaces = vec![NetworkInterfaceSpec {
                device_index: 0,
                associate_public_ip_address: first.associate_public_ip_address,
                subnet_id: reference.subnet_id.clone(),
                groups: reference.security_group_ids.clone(),
            }];
            spec.security_group_ids.clear();
            spec.security_groups.clear();
        } else {
            spec.network_interfaces.clear();
            spec.security_group_ids
                .extend(source.security_group_ids.iter().cloned());
            spec.security_groups
                .extend(source.security_groups.iter().cloned());
        }
    }

    fn apply_launch_configuration(
        &self,
        spec: &mut LaunchTemplateSpec,
        reference: &Instance,
        source: &LaunchConfigSource,
    ) {
        if let Some(key_name) = source.key_name.as_deref() {
            if !key_name.is_empty() {
                spec.key_name = Some(key_name.to_string());
            }
        }
        if let Some(profile) = source.iam_instance_profile.as_deref() {
            spec.iam_instance_profile = Some(IamProfileSpec::from_launch_configuration(profile));
        }
        spec.image_id = source.image_id.clone();
        spec.user_data = source.user_data.as_deref().map(|ud| self.user_data(ud));

        let converted = self.convert(&source.block_device_mappings);
        if !converted.is_empty() {
            spec.block_device_mappings = converted;
        }
        if let Some(enabled) = source.monitoring_enabled {
            spec.monitoring_enabled = Some(enabled);
        }

        if source.associate_public_ip_address.is_some() || reference.subnet_id.is_some() {
            // The instances run in a VPC.
            spec.network_interfaces = vec![NetworkInterfaceSpec {
                device_index: 0,
                associate_public_ip_address: source.associate_public_ip_address,
                subnet_id: reference.subnet_id.clone(),
                groups: reference.security_group_ids.clone(),
            }];
            spec.security_group_ids.clear();
            spec.security_groups.clear();
        }
    }

    fn user_data(&self, user_data: &str) -> String {
        if self.patch_beanstalk_userdata {
            crate::userdata::patch_beanstalk_user_data(user_data)
        } else {
            user_data.to_string()
        }
    }

    /// The instance-scoped tag set every replacement carries: the three
    /// identifying tags, the provisioning back-reference, and the
    /// propagatable tags of the instance being replaced.
    fn identifying_tags(&self, reference: &Instance) -> TagSpecificationSpec {
        let mut tag_list: Vec<(String, String)> = vec![
            (LAUNCHED_BY_TAG.to_string(), "true".to_string()),
            (LAUNCHED_FOR_ASG_TAG.to_string(), self.group_name.to_string()),
            (
                LAUNCHED_FOR_REPLACING_TAG.to_string(),
                reference.id.clone(),
            ),
        ];

        if let Some(template) = self.launch_template {
            tag_list.push((LAUNCH_TEMPLATE_ID_TAG.to_string(), template.id.clone()));
            tag_list.push((
                LAUNCH_TEMPLATE_VERSION_TAG.to_string(),
                template.version.clone(),
            ));
        } else if let Some(name) = self.launch_configuration_name {
            tag_list.push((LAUNCH_CONFIGURATION_NAME_TAG.to_string(), name.to_string()));
        }

        tag_list.extend(
            reference
                .tags
                .iter()
                .filter(|(key, _)| tags::is_propagatable(key))
                .map(|(key, value)| (key.clone(), value.clone())),
        );

        TagSpecificationSpec {
            resource_type: "instance".to_string(),
            tags: tag_list,
        }
    }
}
