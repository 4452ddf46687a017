use std::fmt;

use pgfleet_state::{InstanceId, InstanceRole, ResourceLimits};
use serde::Serialize;

/// One idempotent step towards the desired topology.
///
/// Every action names the instance it concerns by its stable id, so
/// executing it twice has the same effect as executing it once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    ProvisionVolume {
        instance: InstanceId,
        ordinal: u32,
        size_bytes: u64,
        storage_class: Option<String>,
    },
    CreateInstance {
        instance: InstanceId,
        ordinal: u32,
        role: InstanceRole,
        /// Initialize a fresh data directory (initdb or restore) rather than
        /// start on an existing volume.
        bootstrap: bool,
        image: String,
        resources: ResourceLimits,
    },
    ExpandVolume {
        instance: InstanceId,
        size_bytes: u64,
    },
    ApplyResources {
        instance: InstanceId,
        resources: ResourceLimits,
    },
    UpdateImage {
        instance: InstanceId,
        image: String,
    },
    /// Planned hand-over of the primary role ahead of updating it.
    Switchover {
        from: InstanceId,
        to: InstanceId,
    },
    FenceInstance {
        instance: InstanceId,
    },
    DeleteInstance {
        instance: InstanceId,
    },
    DeleteVolume {
        instance: InstanceId,
    },
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::ProvisionVolume { .. } => "provision_volume",
            Action::CreateInstance { .. } => "create_instance",
            Action::ExpandVolume { .. } => "expand_volume",
            Action::ApplyResources { .. } => "apply_resources",
            Action::UpdateImage { .. } => "update_image",
            Action::Switchover { .. } => "switchover",
            Action::FenceInstance { .. } => "fence_instance",
            Action::DeleteInstance { .. } => "delete_instance",
            Action::DeleteVolume { .. } => "delete_volume",
        }
    }

    /// Instance whose branch of the plan this action belongs to. `None` for
    /// actions that change the role of more than one instance.
    pub fn instance(&self) -> Option<&str> {
        match self {
            Action::ProvisionVolume { instance, .. }
            | Action::CreateInstance { instance, .. }
            | Action::ExpandVolume { instance, .. }
            | Action::ApplyResources { instance, .. }
            | Action::UpdateImage { instance, .. }
            | Action::FenceInstance { instance }
            | Action::DeleteInstance { instance }
            | Action::DeleteVolume { instance } => Some(instance),
            Action::Switchover { .. } => None,
        }
    }

    /// Stable key used for status annotations, e.g. `create_instance/orders-2`.
    pub fn key(&self) -> String {
        match self {
            Action::Switchover { from, .. } => format!("switchover/{from}"),
            other => format!("{}/{}", other.kind(), other.instance().unwrap_or("-")),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::ProvisionVolume {
                instance,
                size_bytes,
                ..
            } => write!(f, "provision {size_bytes}-byte volume for {instance}"),
            Action::CreateInstance {
                instance, role, ..
            } => write!(f, "create {instance} as {role:?}"),
            Action::ExpandVolume {
                instance,
                size_bytes,
            } => write!(f, "expand volume of {instance} to {size_bytes} bytes"),
            Action::ApplyResources { instance, .. } => write!(f, "apply resources to {instance}"),
            Action::UpdateImage { instance, image } => write!(f, "update {instance} to {image}"),
            Action::Switchover { from, to } => write!(f, "switch primary from {from} to {to}"),
            Action::FenceInstance { instance } => write!(f, "fence {instance}"),
            Action::DeleteInstance { instance } => write!(f, "delete {instance}"),
            Action::DeleteVolume { instance } => write!(f, "delete volume of {instance}"),
        }
    }
}

/// Difference the planner saw and will not act on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "drift", rename_all = "snake_case")]
pub enum IgnoredDrift {
    /// Volumes are never shrunk.
    StorageShrink {
        instance: InstanceId,
        current_bytes: u64,
        desired_bytes: u64,
    },
    /// Major upgrades need a dump/restore or pg_upgrade, not a rolling restart.
    MajorVersionChange {
        instance: InstanceId,
        current: String,
        desired: String,
    },
}

impl fmt::Display for IgnoredDrift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IgnoredDrift::StorageShrink {
                instance,
                current_bytes,
                desired_bytes,
            } => write!(
                f,
                "storage shrink ignored for {instance}: {current_bytes} -> {desired_bytes} bytes"
            ),
            IgnoredDrift::MajorVersionChange {
                instance,
                current,
                desired,
            } => write!(
                f,
                "major version change ignored for {instance}: {current} -> {desired}"
            ),
        }
    }
}

/// Planner output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub actions: Vec<Action>,
    pub ignored: Vec<IgnoredDrift>,
}

impl Plan {
    pub fn is_converged(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn creates(&self) -> usize {
        self.count(|a| matches!(a, Action::CreateInstance { .. }))
    }

    pub fn deletes(&self) -> usize {
        self.count(|a| matches!(a, Action::DeleteInstance { .. }))
    }

    fn count(&self, pred: impl Fn(&Action) -> bool) -> usize {
        self.actions.iter().filter(|a| pred(a)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_stable() {
        let create = Action::DeleteVolume {
            instance: "orders-3".to_string(),
        };
        assert_eq!(create.key(), "delete_volume/orders-3");
        assert_eq!(create.instance(), Some("orders-3"));

        let switch = Action::Switchover {
            from: "orders-1".to_string(),
            to: "orders-2".to_string(),
        };
        assert_eq!(switch.key(), "switchover/orders-1");
        assert_eq!(switch.instance(), None);
    }

    #[test]
    fn actions_serialize_tagged() {
        let action = Action::ExpandVolume {
            instance: "orders-1".to_string(),
            size_bytes: 42,
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["action"], "expand_volume");
        assert_eq!(json["size_bytes"], 42);
    }
}
