//! Placement-rule predicates.
//!
//! Each rule becomes a predicate over (offer, deployed tasks). Deployed
//! tasks carry their pod, pod-instance, hostname, and domain as labels,
//! stamped at launch time; the predicates work entirely off those labels.

use berth_proto::{labels, Offer, TaskInfo};
use berth_spec::PlacementRule;

/// Check every rule against the offer. Returns the first failure reason.
pub fn check_rules(
    rules: &[PlacementRule],
    offer: &Offer,
    pod: &str,
    pod_instance: &str,
    deployed: &[TaskInfo],
) -> Result<(), String> {
    for rule in rules {
        check_rule(rule, offer, pod, pod_instance, deployed)?;
    }
    Ok(())
}

fn check_rule(
    rule: &PlacementRule,
    offer: &Offer,
    pod: &str,
    pod_instance: &str,
    deployed: &[TaskInfo],
) -> Result<(), String> {
    match rule {
        PlacementRule::HostnameUnique => {
            if other_instances(deployed, pod, pod_instance)
                .any(|t| label(t, labels::HOSTNAME) == Some(offer.hostname.as_str()))
            {
                return Err(format!(
                    "hostname {} already runs an instance of pod {pod}",
                    offer.hostname
                ));
            }
            Ok(())
        }
        PlacementRule::ZoneUnique => {
            let zone = offer
                .domain
                .as_ref()
                .map(|d| d.zone.as_str())
                .ok_or_else(|| "offer has no fault domain for zone rule".to_string())?;
            if other_instances(deployed, pod, pod_instance)
                .any(|t| label(t, labels::ZONE) == Some(zone))
            {
                return Err(format!("zone {zone} already runs an instance of pod {pod}"));
            }
            Ok(())
        }
        PlacementRule::RegionIs { region } => {
            let offered = offer.domain.as_ref().map(|d| d.region.as_str());
            if offered != Some(region.as_str()) {
                return Err(format!(
                    "agent region {} does not match required region {region}",
                    offered.unwrap_or("<none>")
                ));
            }
            Ok(())
        }
        PlacementRule::AttributeEquals { key, value } => {
            if offer.attributes.get(key) != Some(value) {
                return Err(format!("agent attribute {key} is not {value}"));
            }
            Ok(())
        }
        PlacementRule::MaxPerHostname { limit } => {
            let mut instances: Vec<&str> = other_instances(deployed, pod, pod_instance)
                .filter(|t| label(t, labels::HOSTNAME) == Some(offer.hostname.as_str()))
                .filter_map(|t| label(t, labels::POD_INSTANCE))
                .collect();
            instances.sort_unstable();
            instances.dedup();
            if instances.len() as u32 >= *limit {
                return Err(format!(
                    "hostname {} already at limit {limit} for pod {pod}",
                    offer.hostname
                ));
            }
            Ok(())
        }
        PlacementRule::ColocateWith { pod: other } => {
            if deployed.iter().any(|t| {
                label(t, labels::POD) == Some(other.as_str())
                    && label(t, labels::HOSTNAME) == Some(offer.hostname.as_str())
            }) {
                Ok(())
            } else {
                Err(format!(
                    "hostname {} runs no instance of pod {other} to colocate with",
                    offer.hostname
                ))
            }
        }
    }
}

/// Deployed tasks of `pod` belonging to a different pod instance.
fn other_instances<'a>(
    deployed: &'a [TaskInfo],
    pod: &'a str,
    pod_instance: &'a str,
) -> impl Iterator<Item = &'a TaskInfo> {
    deployed.iter().filter(move |t| {
        label(t, labels::POD) == Some(pod) && label(t, labels::POD_INSTANCE) != Some(pod_instance)
    })
}

fn label<'a>(task: &'a TaskInfo, key: &str) -> Option<&'a str> {
    task.labels.get(key).map(String::as_str)
}
