//! Fleet launcher: wraps the projected launch template in a temporary
//! launch template, runs an instant fleet request for exactly one spot
//! unit, and disposes of the template on every exit path.

use tracing::{info, warn};

use autospot_common::defaults::TEMPORARY_LAUNCH_TEMPLATE_PREFIX;
use autospot_common::SpotAllocationStrategy;

use crate::aws::ec2::Ec2Ops;
use crate::aws::error::classify_anyhow_error;
use crate::catalog::InstanceTypeInformation;
use crate::error::{ReplacementError, Result};
use crate::instance::Instance;
use crate::projection::LaunchTemplateSpec;

/// One launch override: a candidate type in the reference subnet.
#[derive(Debug, Clone, PartialEq)]
pub struct FleetOverrideSpec {
    pub instance_type: String,
    pub subnet_id: Option<String>,
    /// Ascending launch priority, zero being the cheapest candidate. Only
    /// set under the capacity-optimized-prioritized strategy.
    pub priority: Option<f64>,
}

/// An instant fleet request for one spot unit.
#[derive(Debug, Clone, PartialEq)]
pub struct FleetRequest {
    pub template_name: String,
    pub overrides: Vec<FleetOverrideSpec>,
    pub allocation_strategy: SpotAllocationStrategy,
}

/// One launch error reported by the fleet response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetLaunchError {
    pub code: String,
    pub message: String,
}

/// What the fleet request produced.
#[derive(Debug, Clone, Default)]
pub struct FleetOutcome {
    pub instance_ids: Vec<String>,
    pub errors: Vec<FleetLaunchError>,
}

/// Name of the temporary launch template for a replaced instance. Stable
/// across runs so a template leaked by a crashed run is found by name.
pub fn temporary_template_name(instance_id: &str) -> String {
    format!("{TEMPORARY_LAUNCH_TEMPLATE_PREFIX}{instance_id}")
}

/// Builds the override list from the price-sorted candidates.
pub fn build_overrides(
    reference: &Instance,
    candidates: &[InstanceTypeInformation],
    strategy: SpotAllocationStrategy,
) -> Vec<FleetOverrideSpec> {
    candidates
        .iter()
        .enumerate()
        .map(|(position, candidate)| FleetOverrideSpec {
            instance_type: candidate.instance_type.clone(),
            subnet_id: reference.subnet_id.clone(),
            priority: strategy.is_prioritized().then_some(position as f64),
        })
        .collect()
}

/// Drives one launch: temporary template, fleet request, teardown.
pub struct FleetLauncher<'a, E: Ec2Ops> {
    ec2: &'a E,
}

impl<'a, E: Ec2Ops> FleetLauncher<'a, E> {
    pub fn new(ec2: &'a E) -> Self {
        Self { ec2 }
    }

    /// Launch one spot replacement for `reference` across the candidate
    /// types. Returns the launched instance id.
    pub async fn launch_spot_replacement(
        &self,
        reference: &Instance,
        template_data: LaunchTemplateSpec,
        candidates: &[InstanceTypeInformation],
        strategy: SpotAllocationStrategy,
    ) -> Result<String> {
        let template_name = temporary_template_name(&reference.id);

        if let Err(error) = self
            .ec2
            .create_launch_template(template_name.clone(), template_data)
            .await
        {
            if classify_anyhow_error(&error).is_already_exists() {
                // Left behind by an earlier crashed run; take it and use it.
                info!(template = %template_name, "Reusing existing launch template");
            } else {
                return Err(ReplacementError::Cloud(error));
            }
        }

        let request = FleetRequest {
            template_name: template_name.clone(),
            overrides: build_overrides(reference, candidates, strategy),
            allocation_strategy: strategy,
        };

        let launch_result = self.ec2.create_fleet(request).await;

        // The template is disposable on every exit path; a failed delete
        // only costs a leaked name that the next run reuses.
        if let Err(error) = self.ec2.delete_launch_template(template_name.clone()).await {
            warn!(template = %template_name, %error, "Failed to delete temporary launch template");
        }

        let outcome = launch_result.map_err(ReplacementError::Cloud)?;

        if let Some(instance_id) = outcome.instance_ids.first() {
            info!(
                instance_id = %instance_id,
                replacing = %reference.id,
                "Launched spot replacement"
            );
            return Ok(instance_id.clone());
        }

        if !outcome.errors.is_empty() {
            warn!(errors = ?outcome.errors, "Fleet could not launch any override");
            return Err(ReplacementError::CapacityExhausted);
        }

        Err(ReplacementError::Cloud(anyhow::anyhow!(
            "fleet request returned neither instances nor errors"
        )))
    }
}
