use std::collections::BTreeSet;

use pgfleet_state::{
    ClusterSpec, ClusterStatus, FenceReason, InstanceId, InstancePhase, InstanceRecord,
    InstanceRole, VolumeRecord, promotion_candidate,
};

use crate::action::{Action, IgnoredDrift, Plan};
use crate::version::same_major;

/// Compute the actions that move `status` towards `spec`.
///
/// While any instance is held for split-brain resolution the topology is
/// frozen: instance count and image are left alone until the hold is
/// cleared.
pub fn plan(spec: &ClusterSpec, status: &ClusterStatus) -> Plan {
    let mut out = Plan::default();
    let frozen = held_count(status) > 0;

    // Volumes that are free (or about to be) and may back a new instance.
    let mut reusable: Vec<(u32, InstanceId)> = Vec::new();

    for inst in status.instances.iter().filter(|i| is_removable(i)) {
        out.actions.push(Action::DeleteInstance {
            instance: inst.id.clone(),
        });
        if status.volumes.contains_key(&inst.id) {
            if inst.fence_reason == Some(FenceReason::ScaleDown) {
                out.actions.push(Action::DeleteVolume {
                    instance: inst.id.clone(),
                });
            } else {
                reusable.push((inst.ordinal, inst.id.clone()));
            }
        }
    }
    reusable.extend(
        status
            .orphan_volumes()
            .map(|(id, vol)| (vol.ordinal, id.clone())),
    );
    reusable.sort();

    let victims = if frozen {
        BTreeSet::new()
    } else {
        plan_scaling(spec, status, &mut reusable, &mut out)
    };

    for inst in status
        .live_instances()
        .filter(|i| !victims.contains(&i.id))
    {
        plan_instance(spec, status, inst, &mut out);
    }

    if !frozen {
        plan_image_rollout(spec, status, &victims, &mut out);
    }

    out
}

/// Whether `status` already matches `spec`; true exactly when [`plan`]
/// returns no actions.
pub fn satisfies(spec: &ClusterSpec, status: &ClusterStatus) -> bool {
    if status.instances.iter().any(is_removable) {
        return false;
    }

    let frozen = held_count(status) > 0;
    if !frozen {
        if status.orphan_volumes().next().is_some() {
            return false;
        }
        if status.live_count() + held_count(status) != spec.instances as usize {
            return false;
        }
    }

    status.live_instances().all(|inst| {
        let volume_ok = status
            .volumes
            .get(&inst.id)
            .is_some_and(|v| v.size_bytes >= spec.storage.size_bytes);
        let image_ok = frozen || inst.image == spec.image || !same_major(&inst.image, &spec.image);
        volume_ok && image_ok && inst.resources == spec.resources
    })
}

fn is_removable(inst: &InstanceRecord) -> bool {
    match inst.phase {
        InstancePhase::Terminated => true,
        InstancePhase::Fencing => inst.fence_reason != Some(FenceReason::SplitBrain),
        _ => false,
    }
}

fn held_count(status: &ClusterStatus) -> usize {
    status
        .instances
        .iter()
        .filter(|i| {
            i.phase == InstancePhase::Fencing && i.fence_reason == Some(FenceReason::SplitBrain)
        })
        .count()
}

/// Scale the live instance count to `spec.instances`. Returns the
/// instances chosen for scale-down.
fn plan_scaling(
    spec: &ClusterSpec,
    status: &ClusterStatus,
    reusable: &mut Vec<(u32, InstanceId)>,
    out: &mut Plan,
) -> BTreeSet<InstanceId> {
    let desired = spec.instances as usize;
    let live = status.live_count();
    let mut victims = BTreeSet::new();

    if live > desired {
        // Highest ordinals go first; the primary is never a victim.
        let mut replicas: Vec<&InstanceRecord> = status
            .live_instances()
            .filter(|i| i.role == InstanceRole::Replica)
            .collect();
        replicas.sort_by(|a, b| b.ordinal.cmp(&a.ordinal));
        for inst in replicas.into_iter().take(live - desired) {
            out.actions.push(Action::FenceInstance {
                instance: inst.id.clone(),
            });
            out.actions.push(Action::DeleteInstance {
                instance: inst.id.clone(),
            });
            if status.volumes.contains_key(&inst.id) {
                out.actions.push(Action::DeleteVolume {
                    instance: inst.id.clone(),
                });
            }
            victims.insert(inst.id.clone());
        }
    }

    let needs_primary = live == 0;
    if needs_primary {
        // Bring the last primary back on its own data when it is available.
        if let Some(last) = &status.primary {
            if let Some(pos) = reusable.iter().position(|(_, id)| id == last) {
                let entry = reusable.remove(pos);
                reusable.insert(0, entry);
            }
        }
    }

    let mut pool = std::mem::take(reusable).into_iter();
    let mut next_ordinal = status.next_ordinal;
    for k in 0..desired.saturating_sub(live) {
        let role = if needs_primary && k == 0 {
            InstanceRole::Primary
        } else {
            InstanceRole::Replica
        };

        let (instance, ordinal, fresh) = match pool.next() {
            Some((ordinal, id)) => {
                if let Some(vol) = status.volumes.get(&id) {
                    if vol.size_bytes < spec.storage.size_bytes {
                        out.actions.push(Action::ExpandVolume {
                            instance: id.clone(),
                            size_bytes: spec.storage.size_bytes,
                        });
                    }
                }
                (id, ordinal, false)
            }
            None => {
                let ordinal = next_ordinal;
                next_ordinal += 1;
                let id = spec.instance_id(ordinal);
                out.actions.push(Action::ProvisionVolume {
                    instance: id.clone(),
                    ordinal,
                    size_bytes: spec.storage.size_bytes,
                    storage_class: spec.storage.storage_class.clone(),
                });
                (id, ordinal, true)
            }
        };

        out.actions.push(Action::CreateInstance {
            instance,
            ordinal,
            role,
            // A volume never served by a routed primary holds no data yet.
            bootstrap: role == InstanceRole::Primary && (fresh || status.primary.is_none()),
            image: spec.image.clone(),
            resources: spec.resources,
        });
    }

    for (_, id) in pool {
        out.actions.push(Action::DeleteVolume { instance: id });
    }

    victims
}

fn plan_instance(spec: &ClusterSpec, status: &ClusterStatus, inst: &InstanceRecord, out: &mut Plan) {
    match status.volumes.get(&inst.id) {
        None => out.actions.push(Action::ProvisionVolume {
            instance: inst.id.clone(),
            ordinal: inst.ordinal,
            size_bytes: spec.storage.size_bytes,
            storage_class: spec.storage.storage_class.clone(),
        }),
        Some(VolumeRecord { size_bytes, .. }) if *size_bytes < spec.storage.size_bytes => {
            out.actions.push(Action::ExpandVolume {
                instance: inst.id.clone(),
                size_bytes: spec.storage.size_bytes,
            })
        }
        Some(VolumeRecord { size_bytes, .. }) if *size_bytes > spec.storage.size_bytes => {
            out.ignored.push(IgnoredDrift::StorageShrink {
                instance: inst.id.clone(),
                current_bytes: *size_bytes,
                desired_bytes: spec.storage.size_bytes,
            })
        }
        Some(_) => {}
    }

    if inst.resources != spec.resources {
        out.actions.push(Action::ApplyResources {
            instance: inst.id.clone(),
            resources: spec.resources,
        });
    }
}

/// At most one image action per plan: replicas in ordinal order, then the
/// primary, handed over to the best replica first when one is ready.
fn plan_image_rollout(
    spec: &ClusterSpec,
    status: &ClusterStatus,
    victims: &BTreeSet<InstanceId>,
    out: &mut Plan,
) {
    let mut outdated: Vec<&InstanceRecord> = Vec::new();
    for inst in status
        .live_instances()
        .filter(|i| !victims.contains(&i.id) && i.image != spec.image)
    {
        if same_major(&inst.image, &spec.image) {
            outdated.push(inst);
        } else {
            out.ignored.push(IgnoredDrift::MajorVersionChange {
                instance: inst.id.clone(),
                current: inst.image.clone(),
                desired: spec.image.clone(),
            });
        }
    }

    if let Some(replica) = outdated.iter().find(|i| i.role == InstanceRole::Replica) {
        out.actions.push(Action::UpdateImage {
            instance: replica.id.clone(),
            image: spec.image.clone(),
        });
        return;
    }

    let Some(primary) = outdated.first() else {
        return;
    };
    let candidate = promotion_candidate(
        status
            .live_instances()
            .filter(|i| !victims.contains(&i.id) && i.id != primary.id),
    );
    match candidate {
        Some(to) => out.actions.push(Action::Switchover {
            from: primary.id.clone(),
            to: to.id.clone(),
        }),
        None => out.actions.push(Action::UpdateImage {
            instance: primary.id.clone(),
            image: spec.image.clone(),
        }),
    }
}
