//! Ownership indexer
//!
//! Rebuilds the per-StackSet containers from flat lists of observed cluster
//! resources. Ownership is resolved through the first owner reference only;
//! objects with unknown or ambiguous owners are dropped. The indexer never
//! fails the pass.

use crate::controllers::container::{StackContainer, StackSetContainer};
use crate::controllers::prescale::PrescalingTrafficReconciler;
use crate::controllers::reconciler::{SimpleTrafficReconciler, TrafficReconciler};
use crate::controllers::{
    CONTROLLER_ANNOTATION_KEY, PRESCALE_STACKS_ANNOTATION_KEY,
    RESET_HPA_MIN_REPLICAS_DELAY_ANNOTATION_KEY,
};
use crate::crd::{RouteGroup, Stack, StackSet};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::warn;

/// Cool-down before the HPA floor relaxes after prescaling, unless overridden
/// by annotation
pub const DEFAULT_RESET_MIN_REPLICAS_DELAY: Duration = Duration::from_secs(300);

/// Flat resource lists observed for one namespace
#[derive(Debug, Clone, Default)]
pub struct ClusterState {
    pub stack_sets: Vec<StackSet>,
    pub stacks: Vec<Stack>,
    pub deployments: Vec<Deployment>,
    pub services: Vec<Service>,
    pub hpas: Vec<HorizontalPodAutoscaler>,
    pub ingresses: Vec<Ingress>,
    pub route_groups: Vec<RouteGroup>,
}

/// Returns the UID of the first owner reference, if any.
pub fn get_owner_uid(meta: &ObjectMeta) -> Option<&str> {
    meta.owner_references
        .as_ref()?
        .first()
        .map(|r| r.uid.as_str())
}

/// Chooses the traffic reconciler variant for a StackSet from its annotations.
pub fn reconciler_for(stack_set: &StackSet) -> TrafficReconciler {
    let empty = BTreeMap::new();
    let annotations = stack_set.metadata.annotations.as_ref().unwrap_or(&empty);

    if !annotations.contains_key(PRESCALE_STACKS_ANNOTATION_KEY) {
        return TrafficReconciler::Simple(SimpleTrafficReconciler);
    }

    let timeout = annotations
        .get(RESET_HPA_MIN_REPLICAS_DELAY_ANNOTATION_KEY)
        .and_then(|raw| match humantime::parse_duration(raw) {
            Ok(delay) => Some(delay),
            Err(err) => {
                warn!(
                    stackset = stack_set.metadata.name.as_deref().unwrap_or_default(),
                    value = raw.as_str(),
                    error = %err,
                    "Ignoring malformed reset-hpa-min-replicas-delay annotation",
                );
                None
            }
        })
        .unwrap_or(DEFAULT_RESET_MIN_REPLICAS_DELAY);

    TrafficReconciler::Prescaling(PrescalingTrafficReconciler::new(timeout))
}

fn reconciled_by(stack_set: &StackSet, controller_id: Option<&str>) -> bool {
    match stack_set
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(CONTROLLER_ANNOTATION_KEY))
    {
        None => true,
        Some(id) => controller_id == Some(id.as_str()),
    }
}

/// Assembles per-StackSet containers from flat resource lists.
///
/// StackSets carrying a controller annotation that does not match
/// `controller_id` are skipped entirely. Stacks resolve to their owning
/// StackSet; Deployments resolve to their owning Stack; Services and HPAs may
/// be owned by the Stack directly or by its Deployment (one hop); Ingresses
/// and RouteGroups may be owned by a Stack or top-level by the StackSet, but
/// never by a Deployment.
pub fn collect_resources(
    state: ClusterState,
    controller_id: Option<&str>,
) -> BTreeMap<String, StackSetContainer> {
    let mut containers: BTreeMap<String, StackSetContainer> = BTreeMap::new();

    for stack_set in state.stack_sets {
        if !reconciled_by(&stack_set, controller_id) {
            continue;
        }
        let Some(uid) = stack_set.metadata.uid.clone() else {
            continue;
        };
        let traffic_reconciler = reconciler_for(&stack_set);
        containers.insert(
            uid,
            StackSetContainer {
                stack_set,
                stack_containers: BTreeMap::new(),
                ingress: None,
                route_group: None,
                traffic_reconciler,
            },
        );
    }

    // stack UID -> owning stackset UID
    let mut stack_owner: BTreeMap<String, String> = BTreeMap::new();
    for stack in state.stacks {
        let Some(owner) = get_owner_uid(&stack.metadata).map(str::to_string) else {
            continue;
        };
        let Some(container) = containers.get_mut(&owner) else {
            continue;
        };
        let Some(uid) = stack.metadata.uid.clone() else {
            continue;
        };
        stack_owner.insert(uid.clone(), owner);
        container
            .stack_containers
            .insert(uid, StackContainer::new(stack));
    }

    // deployment UID -> owning stack UID, for the one-hop walk
    let mut deployment_owner: BTreeMap<String, String> = BTreeMap::new();
    for deployment in state.deployments {
        let Some(owner) = get_owner_uid(&deployment.metadata).map(str::to_string) else {
            continue;
        };
        let Some(sc) = stack_container_mut(&mut containers, &stack_owner, &owner) else {
            continue;
        };
        if let Some(uid) = deployment.metadata.uid.clone() {
            deployment_owner.insert(uid, owner.clone());
        }
        sc.resources.deployment = Some(deployment);
    }

    for service in state.services {
        let Some(stack_uid) = resolve_stack(&service.metadata, &stack_owner, &deployment_owner)
        else {
            continue;
        };
        if let Some(sc) = stack_container_mut(&mut containers, &stack_owner, &stack_uid) {
            sc.resources.service = Some(service);
        }
    }

    for hpa in state.hpas {
        let Some(stack_uid) = resolve_stack(&hpa.metadata, &stack_owner, &deployment_owner) else {
            continue;
        };
        if let Some(sc) = stack_container_mut(&mut containers, &stack_owner, &stack_uid) {
            sc.resources.hpa = Some(hpa);
        }
    }

    // Ingresses and routegroups may be stack-owned or stackset-owned, but a
    // deployment-owned routing object is dropped.
    for ingress in state.ingresses {
        let Some(owner) = get_owner_uid(&ingress.metadata).map(str::to_string) else {
            continue;
        };
        if let Some(sc) = stack_container_mut(&mut containers, &stack_owner, &owner) {
            sc.resources.ingress = Some(ingress);
        } else if let Some(container) = containers.get_mut(&owner) {
            container.ingress = Some(ingress);
        }
    }

    for route_group in state.route_groups {
        let Some(owner) = get_owner_uid(&route_group.metadata).map(str::to_string) else {
            continue;
        };
        if let Some(sc) = stack_container_mut(&mut containers, &stack_owner, &owner) {
            sc.resources.route_group = Some(route_group);
        } else if let Some(container) = containers.get_mut(&owner) {
            container.route_group = Some(route_group);
        }
    }

    containers
}

fn resolve_stack(
    meta: &ObjectMeta,
    stack_owner: &BTreeMap<String, String>,
    deployment_owner: &BTreeMap<String, String>,
) -> Option<String> {
    let owner = get_owner_uid(meta)?;
    if stack_owner.contains_key(owner) {
        return Some(owner.to_string());
    }
    deployment_owner.get(owner).cloned()
}

fn stack_container_mut<'a>(
    containers: &'a mut BTreeMap<String, StackSetContainer>,
    stack_owner: &BTreeMap<String, String>,
    stack_uid: &str,
) -> Option<&'a mut StackContainer> {
    let stackset_uid = stack_owner.get(stack_uid)?;
    containers
        .get_mut(stackset_uid)?
        .stack_containers
        .get_mut(stack_uid)
}
