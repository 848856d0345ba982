//! Domain model of a running instance and the per-region instance index.
//!
//! Instances are materialized from a fresh describe call at event entry and
//! discarded at the end of the handler; nothing here is cached across
//! invocations.

use std::collections::BTreeMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use autospot_common::tags::{LAUNCHED_FOR_ASG_TAG, LAUNCHED_FOR_REPLACING_TAG};

/// Purchase lifecycle of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstanceLifecycle {
    #[default]
    OnDemand,
    Spot,
}

/// Coarse instance state, as reported by the cloud provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstanceState {
    #[default]
    Pending,
    Running,
    ShuttingDown,
    Stopping,
    Stopped,
    Terminated,
    Other,
}

impl InstanceState {
    pub fn is_running(&self) -> bool {
        matches!(self, InstanceState::Running)
    }
}

/// A described instance, reduced to the attributes the engine acts on.
#[derive(Debug, Clone, Default)]
pub struct Instance {
    pub id: String,
    pub lifecycle: InstanceLifecycle,
    pub state: InstanceState,
    pub availability_zone: String,
    pub subnet_id: Option<String>,
    pub security_group_ids: Vec<String>,
    pub image_id: Option<String>,
    pub ebs_optimized: bool,
    /// "hvm" or "paravirtual", as reported by the provider.
    pub virtualization_type: String,
    pub instance_type: String,
    pub launch_time: Option<DateTime<Utc>>,
    pub tags: BTreeMap<String, String>,
}

impl Instance {
    pub fn is_spot(&self) -> bool {
        self.lifecycle == InstanceLifecycle::Spot
    }

    /// An instance can only be terminated while it is not already on the way
    /// out.
    pub fn can_terminate(&self) -> bool {
        !matches!(
            self.state,
            InstanceState::Terminated | InstanceState::ShuttingDown
        )
    }

    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// Group this replacement was launched for, from its identifying tag.
    pub fn replacement_target_group(&self) -> Option<&str> {
        self.tag_value(LAUNCHED_FOR_ASG_TAG)
    }

    /// On-demand instance this replacement is meant to displace.
    pub fn replacement_target_instance(&self) -> Option<&str> {
        self.tag_value(LAUNCHED_FOR_REPLACING_TAG)
    }

    /// Seconds since launch, zero when the launch time is unknown.
    pub fn uptime_seconds(&self, now: DateTime<Utc>) -> i64 {
        self.launch_time
            .map(|t| (now - t).num_seconds())
            .unwrap_or(0)
    }

    /// Whether a fresh spot instance may be attached to its group.
    ///
    /// Only a `running` instance that has outlived the group's health-check
    /// grace period is ready. `pending` defers the decision to the next
    /// event; any other state is ineligible.
    pub fn is_ready_to_attach(&self, grace_period_seconds: i64, now: DateTime<Utc>) -> AttachReadiness {
        match self.state {
            InstanceState::Running if self.uptime_seconds(now) > grace_period_seconds => {
                AttachReadiness::Ready
            }
            InstanceState::Running | InstanceState::Pending => AttachReadiness::NotYet,
            _ => AttachReadiness::Ineligible,
        }
    }
}

/// Outcome of the grace-period gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachReadiness {
    Ready,
    /// Still pending or inside the grace period; retry on the next event.
    NotYet,
    Ineligible,
}

/// Per-region id-to-instance index.
///
/// Concurrent lookups during compatibility scans take the read lock;
/// inserts from describe calls take the write lock. Enumeration snapshots
/// the index under the read lock and must not write back into it.
#[derive(Debug, Default)]
pub struct InstanceIndex {
    catalog: RwLock<BTreeMap<String, Instance>>,
}

impl InstanceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, instance: Instance) {
        let mut catalog = self.catalog.write().expect("instance index poisoned");
        catalog.insert(instance.id.clone(), instance);
    }

    pub fn get(&self, id: &str) -> Option<Instance> {
        let catalog = self.catalog.read().expect("instance index poisoned");
        catalog.get(id).cloned()
    }

    pub fn count(&self) -> usize {
        let catalog = self.catalog.read().expect("instance index poisoned");
        catalog.len()
    }

    /// Snapshot of all indexed instances, in id order.
    pub fn snapshot(&self) -> Vec<Instance> {
        let catalog = self.catalog.read().expect("instance index poisoned");
        catalog.values().cloned().collect()
    }
}
