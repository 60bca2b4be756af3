//! The offer evaluator — pure matching of one requirement against offers.
//!
//! Offers are tried in arrival order. Placement rules run first; resource
//! matching walks the requirement's resources in declaration order,
//! preferring an existing reservation (matched by resource-id), then a
//! statically pre-reserved role slice, then a fresh dynamic reservation.
//! The first offer satisfying every requirement yields the complete
//! recommendation set; remaining offers are left for subsequent steps.

use std::collections::{HashMap, HashSet};

use tracing::debug;
use uuid::Uuid;

use berth_proto::offer::ANY_ROLE;
use berth_proto::{
    labels, CommandInfo, Offer, Range, Reservation, Resource, TaskInfo, Value, VolumeInfo,
};
use berth_spec::service::task_full_name;
use berth_spec::TaskSpec;

use crate::outcome::OfferOutcomeTracker;
use crate::placement;
use crate::recommendation::OfferRecommendation;
use crate::requirement::PodInstanceRequirement;

/// Tolerance for scalar resource comparison.
const EPS: f64 = 1e-9;

/// Pure evaluator: no stores, no driver. Resource-ids for fresh
/// reservations are generated here and carried out on the recommendations.
#[derive(Debug, Default)]
pub struct OfferEvaluator;

impl OfferEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Match the requirement against the offer batch. Returns the
    /// recommendations for the first satisfying offer, or an empty list
    /// when none fits; every decision lands in the tracker.
    pub fn evaluate(
        &self,
        req: &PodInstanceRequirement,
        offers: &[Offer],
        tracker: &mut OfferOutcomeTracker,
    ) -> Vec<OfferRecommendation> {
        let instance = req.instance_name();
        for offer in offers {
            if let Err(reason) = placement::check_rules(
                &req.pod.placement,
                offer,
                &req.pod.name,
                &instance,
                &req.deployed,
            ) {
                debug!(offer = %offer.id, %reason, "offer rejected by placement rule");
                tracker.record_fail(&offer.id, &offer.hostname, &instance, &reason);
                continue;
            }

            match try_match(req, offer) {
                Ok(recommendations) => {
                    tracker.record_pass(&offer.id, &offer.hostname, &instance);
                    debug!(
                        offer = %offer.id,
                        recommendations = recommendations.len(),
                        pod_instance = %instance,
                        "offer satisfies requirement"
                    );
                    return recommendations;
                }
                Err(reason) => {
                    debug!(offer = %offer.id, %reason, "offer rejected");
                    tracker.record_fail(&offer.id, &offer.hostname, &instance, &reason);
                }
            }
        }
        Vec::new()
    }
}

/// Attempt to satisfy the whole requirement from one offer.
fn try_match(
    req: &PodInstanceRequirement,
    offer: &Offer,
) -> Result<Vec<OfferRecommendation>, String> {
    // Reservations are agent-bound: a pod instance with live reservations
    // can only relaunch from its own agent's offers.
    for name in &req.tasks_to_launch {
        if let Some(existing) = req.existing.get(name) {
            if !existing.resource_ids().is_empty() && existing.agent_id != offer.agent_id {
                return Err(format!(
                    "pod instance {} is pinned to agent {}",
                    req.instance_name(),
                    existing.agent_id
                ));
            }
        }
    }

    let mut pool: Vec<Resource> = offer.resources.clone();
    let mut reserves: Vec<OfferRecommendation> = Vec::new();
    let mut launches: Vec<OfferRecommendation> = Vec::new();

    for task_spec in &req.pod.tasks {
        let full_name = task_full_name(&req.pod.name, req.instance, &task_spec.name);

        if !req.should_launch(&full_name) {
            // Transient placeholder: keeps the evaluator's bookkeeping
            // whole without touching the pool or reaching the driver.
            if let Some(existing) = req.existing.get(&full_name) {
                launches.push(OfferRecommendation::Launch {
                    offer_id: offer.id.clone(),
                    agent_id: offer.agent_id.clone(),
                    task: existing.clone(),
                    should_launch: false,
                });
            }
            continue;
        }

        let existing = req.existing.get(&full_name);
        let task_resources =
            match_task_resources(req, task_spec, existing, offer, &mut pool, &mut reserves)?;

        let task = build_task_info(req, task_spec, &full_name, offer, task_resources);
        launches.push(OfferRecommendation::Launch {
            offer_id: offer.id.clone(),
            agent_id: offer.agent_id.clone(),
            task,
            should_launch: true,
        });
    }

    reserves.extend(launches);
    Ok(reserves)
}

/// Match one task's resources and volumes, consuming from the pool and
/// appending Reserve/CreateVolume recommendations as needed.
fn match_task_resources(
    req: &PodInstanceRequirement,
    task_spec: &TaskSpec,
    existing: Option<&TaskInfo>,
    offer: &Offer,
    pool: &mut Vec<Resource>,
    reserves: &mut Vec<OfferRecommendation>,
) -> Result<Vec<Resource>, String> {
    let mut matched: Vec<Resource> = Vec::new();
    let mut reused_ids: HashSet<String> = HashSet::new();

    for spec in &task_spec.resources {
        // Prefer the reservation already held for this slot.
        if let Some(rid) = existing_resource_id(existing, &spec.name, None, &reused_ids) {
            let taken = take_reserved(pool, &rid).ok_or_else(|| {
                format!("existing reservation {rid} for {} not in offer", spec.name)
            })?;
            reused_ids.insert(rid);
            matched.push(taken);
            continue;
        }

        // Fresh dynamic reservation from compatible offered resources.
        let resource = match &spec.value {
            Value::Scalar(amount) => {
                take_scalar(pool, &spec.name, *amount, &req.role).ok_or_else(|| {
                    format!(
                        "insufficient {}: want {} have {}",
                        spec.name,
                        amount,
                        available_scalar(pool, &spec.name, &req.role)
                    )
                })?
            }
            Value::Ranges(wanted) => {
                take_ranges(pool, &spec.name, wanted, &req.role).ok_or_else(|| {
                    format!("requested {} ranges not available", spec.name)
                })?
            }
        };
        let reserved = reserve(resource, &req.role, &req.principal);
        reserves.push(OfferRecommendation::Reserve {
            offer_id: offer.id.clone(),
            agent_id: offer.agent_id.clone(),
            resource: reserved.clone(),
        });
        matched.push(reserved);
    }

    for volume in &task_spec.volumes {
        if let Some(rid) =
            existing_resource_id(existing, "disk", Some(&volume.container_path), &reused_ids)
        {
            let taken = take_reserved(pool, &rid).ok_or_else(|| {
                format!(
                    "existing volume {} ({rid}) not in offer",
                    volume.container_path
                )
            })?;
            reused_ids.insert(rid);
            matched.push(taken);
            continue;
        }

        let disk = take_scalar(pool, "disk", volume.size_mb, &req.role).ok_or_else(|| {
            format!(
                "insufficient disk: want {} have {}",
                volume.size_mb,
                available_scalar(pool, "disk", &req.role)
            )
        })?;
        let reserved = reserve(disk, &req.role, &req.principal);
        reserves.push(OfferRecommendation::Reserve {
            offer_id: offer.id.clone(),
            agent_id: offer.agent_id.clone(),
            resource: reserved.clone(),
        });

        let mut volume_resource = reserved;
        volume_resource.disk = Some(VolumeInfo {
            container_path: volume.container_path.clone(),
            persistence_id: Some(Uuid::new_v4().to_string()),
        });
        reserves.push(OfferRecommendation::CreateVolume {
            offer_id: offer.id.clone(),
            agent_id: offer.agent_id.clone(),
            volume: volume_resource.clone(),
        });
        matched.push(volume_resource);
    }

    Ok(matched)
}

/// The resource-id held by the existing task for the given resource kind
/// (and container path, for volumes), skipping ids already reused.
fn existing_resource_id(
    existing: Option<&TaskInfo>,
    name: &str,
    container_path: Option<&str>,
    reused: &HashSet<String>,
) -> Option<String> {
    let existing = existing?;
    existing
        .resources
        .iter()
        .filter(|r| r.name == name)
        .filter(|r| match container_path {
            Some(path) => r
                .disk
                .as_ref()
                .is_some_and(|d| d.container_path == path),
            None => r.disk.is_none(),
        })
        .filter_map(|r| r.resource_id())
        .find(|rid| !reused.contains(*rid))
        .map(str::to_string)
}

/// Tag an offered slice with a fresh reservation under our role.
fn reserve(mut resource: Resource, role: &str, principal: &str) -> Resource {
    resource.role = role.to_string();
    resource.reservation = Some(Reservation {
        principal: principal.to_string(),
        resource_id: Some(Uuid::new_v4().to_string()),
    });
    resource
}

/// Remove the reserved resource with the given resource-id from the pool.
fn take_reserved(pool: &mut Vec<Resource>, resource_id: &str) -> Option<Resource> {
    let index = pool
        .iter()
        .position(|r| r.resource_id() == Some(resource_id))?;
    Some(pool.remove(index))
}

/// Carve `amount` out of the pool's unreserved resources of `name`,
/// preferring a statically pre-reserved slice of our role over the `*`
/// role (avoiding an unnecessary reservation against the general pool).
fn take_scalar(pool: &mut Vec<Resource>, name: &str, amount: f64, role: &str) -> Option<Resource> {
    let index = find_unreserved(pool, name, role, |r| {
        r.scalar().is_some_and(|have| have + EPS >= amount)
    })?;

    let mut taken = pool[index].clone();
    let remaining = pool[index].scalar().unwrap_or(0.0) - amount;
    if remaining > EPS {
        pool[index].value = Value::Scalar(remaining);
    } else {
        pool.remove(index);
    }
    taken.value = Value::Scalar(amount);
    Some(taken)
}

/// Carve the wanted ranges out of an unreserved ranges resource.
fn take_ranges(
    pool: &mut Vec<Resource>,
    name: &str,
    wanted: &[Range],
    role: &str,
) -> Option<Resource> {
    let index = find_unreserved(pool, name, role, |r| match &r.value {
        Value::Ranges(have) => subtract_ranges(have, wanted).is_some(),
        Value::Scalar(_) => false,
    })?;

    let mut taken = pool[index].clone();
    let remaining = match &pool[index].value {
        Value::Ranges(have) => subtract_ranges(have, wanted)?,
        Value::Scalar(_) => return None,
    };
    if remaining.is_empty() {
        pool.remove(index);
    } else {
        pool[index].value = Value::Ranges(remaining);
    }
    taken.value = Value::Ranges(wanted.to_vec());
    Some(taken)
}

/// Index of the first unreserved pool resource of `name` passing `fits`,
/// trying our static role slices before the `*` role.
fn find_unreserved<F>(pool: &[Resource], name: &str, role: &str, fits: F) -> Option<usize>
where
    F: Fn(&Resource) -> bool,
{
    let candidates = |wanted_role: &str| {
        pool.iter().position(|r| {
            r.name == name && r.reservation.is_none() && r.role == wanted_role && fits(r)
        })
    };
    candidates(role).or_else(|| candidates(ANY_ROLE))
}

/// Total unreserved scalar quantity of `name` usable by `role`.
fn available_scalar(pool: &[Resource], name: &str, role: &str) -> f64 {
    pool.iter()
        .filter(|r| r.name == name && r.reservation.is_none())
        .filter(|r| r.role == role || r.role == ANY_ROLE)
        .filter_map(Resource::scalar)
        .sum()
}

/// Remove `wanted` ranges from `have`. None when not fully contained.
fn subtract_ranges(have: &[Range], wanted: &[Range]) -> Option<Vec<Range>> {
    let mut remaining: Vec<Range> = have.to_vec();
    for take in wanted {
        let index = remaining
            .iter()
            .position(|r| r.begin <= take.begin && take.end <= r.end)?;
        let r = remaining.remove(index);
        if r.begin < take.begin {
            remaining.insert(index, Range { begin: r.begin, end: take.begin - 1 });
        }
        if take.end < r.end {
            remaining.push(Range { begin: take.end + 1, end: r.end });
        }
    }
    remaining.sort_by_key(|r| r.begin);
    Some(remaining)
}

/// Assemble the TaskInfo for a launch, stamping placement labels.
fn build_task_info(
    req: &PodInstanceRequirement,
    task_spec: &TaskSpec,
    full_name: &str,
    offer: &Offer,
    resources: Vec<Resource>,
) -> TaskInfo {
    let mut task_labels: HashMap<String, String> = HashMap::new();
    task_labels.insert(labels::CONFIG_ID.to_string(), req.config_id.clone());
    task_labels.insert(labels::POD.to_string(), req.pod.name.clone());
    task_labels.insert(labels::POD_INSTANCE.to_string(), req.instance_name());
    task_labels.insert(labels::HOSTNAME.to_string(), offer.hostname.clone());
    if let Some(domain) = &offer.domain {
        task_labels.insert(labels::REGION.to_string(), domain.region.clone());
        task_labels.insert(labels::ZONE.to_string(), domain.zone.clone());
    }

    TaskInfo {
        name: full_name.to_string(),
        task_id: format!("{full_name}__{}", Uuid::new_v4()),
        agent_id: offer.agent_id.clone(),
        command: CommandInfo {
            value: task_spec.command.clone(),
            environment: task_spec.environment.clone(),
        },
        executor: None,
        resources,
        labels: task_labels,
    }
}
