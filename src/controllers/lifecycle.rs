//! Stack lifecycle
//!
//! Materializes the current stack from the StackSet template and retires old
//! stacks once they have been without traffic for longer than the scaledown
//! TTL and the family exceeds its retention limit.

use crate::controllers::children::stackset_owner_reference;
use crate::controllers::container::{StackContainer, StackSetContainer, TrafficStatus};
use crate::controllers::{
    NO_TRAFFIC_SINCE_ANNOTATION_KEY, STACKSET_HERITAGE_LABEL_KEY, STACK_VERSION_LABEL_KEY,
};
use crate::crd::{Stack, StackSet};
use crate::error::{OperatorError, Result};
use crate::traffic::WEIGHT_EPSILON;
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::{debug, info, warn};

/// Name of the stack the template currently describes, `{stacksetName}-{version}`.
pub fn current_stack_name(stack_set: &StackSet) -> String {
    format!(
        "{}-{}",
        stack_set.metadata.name.as_deref().unwrap_or_default(),
        stack_set.spec.stack_template.spec.version
    )
}

/// Builds a new Stack from the StackSet template.
///
/// The workload spec is copied verbatim; labels are propagated with the
/// heritage and version labels added; the owner reference points at the
/// StackSet so children are garbage-collected with it.
pub fn generate_stack(stack_set: &StackSet) -> Result<Stack> {
    let template = &stack_set.spec.stack_template.spec;

    let containers = template
        .stack_spec
        .pod_template
        .spec
        .as_ref()
        .map(|s| s.containers.len())
        .unwrap_or(0);
    if containers == 0 {
        return Err(OperatorError::InvalidStackSet(
            "stack template has no containers".to_string(),
        ));
    }

    let stackset_name = stack_set.metadata.name.as_deref().unwrap_or_default();
    let mut labels = stack_set.metadata.labels.clone().unwrap_or_default();
    labels.insert(
        STACKSET_HERITAGE_LABEL_KEY.to_string(),
        stackset_name.to_string(),
    );
    labels.insert(
        STACK_VERSION_LABEL_KEY.to_string(),
        template.version.clone(),
    );

    Ok(Stack {
        metadata: ObjectMeta {
            name: Some(current_stack_name(stack_set)),
            namespace: stack_set.metadata.namespace.clone(),
            labels: Some(labels),
            owner_references: Some(vec![stackset_owner_reference(stack_set)]),
            ..Default::default()
        },
        spec: template.stack_spec.clone(),
        status: None,
    })
}

/// Creates the stack for the current template version if it was not observed
/// yet, and records the observed version in the StackSet status. Creation is
/// idempotent: an already-existing stack is not an error.
pub async fn create_current_stack(
    client: &Client,
    container: &mut StackSetContainer,
) -> Result<()> {
    let version = container
        .stack_set
        .spec
        .stack_template
        .spec
        .version
        .clone();
    let observed = container
        .stack_set
        .status
        .as_ref()
        .map(|s| s.observed_stack_version.clone())
        .unwrap_or_default();
    if version == observed {
        return Ok(());
    }

    let namespace = container
        .stack_set
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string());
    let stackset_name = container
        .stack_set
        .metadata
        .name
        .clone()
        .unwrap_or_default();

    let stack = generate_stack(&container.stack_set)?;
    let stack_name = stack.metadata.name.clone().unwrap_or_default();

    let stacks: Api<Stack> = Api::namespaced(client.clone(), &namespace);
    match stacks.create(&PostParams::default(), &stack).await {
        Ok(created) => {
            info!("Created stack {}/{}", namespace, stack_name);
            if let Some(uid) = created.metadata.uid.clone() {
                container
                    .stack_containers
                    .insert(uid, StackContainer::new(created));
            }
        }
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            debug!("Stack {}/{} already exists", namespace, stack_name);
        }
        Err(e) => return Err(OperatorError::KubeApi(e.to_string())),
    }

    let stack_sets: Api<StackSet> = Api::namespaced(client.clone(), &namespace);
    let patch = serde_json::json!({
        "status": {
            "observedStackVersion": version,
        }
    });
    stack_sets
        .patch_status(&stackset_name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(|e| OperatorError::KubeApi(e.to_string()))?;

    container
        .stack_set
        .status
        .get_or_insert_with(Default::default)
        .observed_stack_version = version;

    Ok(())
}

fn no_traffic_since(stack: &Stack) -> Option<DateTime<Utc>> {
    let raw = stack
        .metadata
        .annotations
        .as_ref()?
        .get(NO_TRAFFIC_SINCE_ANNOTATION_KEY)?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Flags stacks for removal.
///
/// A stack becomes a candidate once it has neither desired nor actual traffic
/// and has been idle longer than the scaledown TTL. Candidates are only
/// flagged while the family exceeds its retention limit, oldest first.
pub fn mark_pending_removal(
    container: &mut StackSetContainer,
    traffic: &std::collections::BTreeMap<String, TrafficStatus>,
    now: DateTime<Utc>,
) {
    let lifecycle = &container.stack_set.spec.stack_lifecycle;
    let limit = lifecycle.limit.max(1) as usize;
    let total = container.stack_containers.len();
    if total <= limit {
        return;
    }
    let ttl = chrono::Duration::seconds(lifecycle.scaledown_ttl_seconds as i64);

    let mut candidates: Vec<(DateTime<Utc>, String)> = Vec::new();
    for (uid, sc) in &container.stack_containers {
        let status = traffic.get(sc.name()).copied().unwrap_or_default();
        if status.desired_weight > WEIGHT_EPSILON || status.actual_weight > WEIGHT_EPSILON {
            continue;
        }
        let Some(since) = no_traffic_since(&sc.stack) else {
            continue;
        };
        if now.signed_duration_since(since) <= ttl {
            continue;
        }
        let created = sc
            .stack
            .metadata
            .creation_timestamp
            .as_ref()
            .map(|t| t.0)
            .unwrap_or(now);
        candidates.push((created, uid.clone()));
    }

    candidates.sort();
    let excess = total - limit;
    for (_, uid) in candidates.into_iter().take(excess) {
        if let Some(sc) = container.stack_containers.get_mut(&uid) {
            sc.pending_removal = true;
        }
    }
}

/// Deletes every stack flagged as pending removal; children follow through
/// owner references.
pub async fn cleanup_old_stacks(client: &Client, container: &StackSetContainer) -> Result<()> {
    let namespace = container
        .stack_set
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string());
    let stacks: Api<Stack> = Api::namespaced(client.clone(), &namespace);

    for sc in container.stack_containers.values() {
        if !sc.pending_removal {
            continue;
        }
        let name = sc.name();
        match stacks.delete(name, &Default::default()).await {
            Ok(_) => {
                info!("Deleted stack {}/{}", namespace, name);
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!("Stack {}/{} already gone", namespace, name);
            }
            Err(e) => {
                warn!("Failed to delete stack {}/{}: {}", namespace, name, e);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::reconciler::TrafficReconciler;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use std::collections::BTreeMap;

    fn test_stackset(name: &str, version: &str) -> StackSet {
        let spec = serde_json::from_value(serde_json::json!({
            "stackTemplate": {
                "spec": {
                    "version": version,
                    "replicas": 1,
                    "podTemplate": {"spec": {"containers": [{"name": "app", "image": "nginx"}]}}
                }
            }
        }))
        .unwrap();
        let mut stack_set = StackSet::new(name, spec);
        stack_set.metadata.namespace = Some("default".to_string());
        stack_set.metadata.uid = Some("123".to_string());
        stack_set
    }

    fn idle_stack(name: &str, created_secs_ago: i64, idle_secs: i64, now: DateTime<Utc>) -> Stack {
        let spec = serde_json::from_value(serde_json::json!({
            "podTemplate": {"spec": {"containers": [{"name": "app", "image": "nginx"}]}}
        }))
        .unwrap();
        let mut stack = Stack::new(name, spec);
        stack.metadata.creation_timestamp =
            Some(Time(now - chrono::Duration::seconds(created_secs_ago)));
        stack.metadata.annotations = Some(BTreeMap::from([(
            NO_TRAFFIC_SINCE_ANNOTATION_KEY.to_string(),
            (now - chrono::Duration::seconds(idle_secs)).to_rfc3339(),
        )]));
        stack
    }

    fn container_with(stacks: Vec<Stack>, limit: i32, ttl: u64) -> StackSetContainer {
        let mut stack_set = test_stackset("foo", "v1");
        stack_set.spec.stack_lifecycle.limit = limit;
        stack_set.spec.stack_lifecycle.scaledown_ttl_seconds = ttl;
        let stack_containers = stacks
            .into_iter()
            .enumerate()
            .map(|(i, s)| (format!("uid-{}", i), StackContainer::new(s)))
            .collect();
        StackSetContainer {
            stack_set,
            stack_containers,
            ingress: None,
            route_group: None,
            traffic_reconciler: TrafficReconciler::Simple(Default::default()),
        }
    }

    #[test]
    fn test_current_stack_name() {
        let stack_set = test_stackset("foo", "v1");
        assert_eq!(current_stack_name(&stack_set), "foo-v1");
    }

    #[test]
    fn test_generate_stack() {
        let stack_set = test_stackset("foo", "v1");
        let stack = generate_stack(&stack_set).unwrap();

        assert_eq!(stack.metadata.name.as_deref(), Some("foo-v1"));
        assert_eq!(stack.metadata.namespace.as_deref(), Some("default"));
        assert_eq!(stack.spec.replicas, Some(1));

        let labels = stack.metadata.labels.as_ref().unwrap();
        assert_eq!(labels[STACKSET_HERITAGE_LABEL_KEY], "foo");
        assert_eq!(labels[STACK_VERSION_LABEL_KEY], "v1");

        let owner = &stack.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.uid, "123");
        assert_eq!(owner.kind, "StackSet");
    }

    #[test]
    fn test_generate_stack_rejects_empty_template() {
        let mut stack_set = test_stackset("foo", "v1");
        stack_set.spec.stack_template.spec.stack_spec.pod_template = Default::default();

        let err = generate_stack(&stack_set).unwrap_err();
        assert!(matches!(err, OperatorError::InvalidStackSet(_)));
    }

    #[test]
    fn test_mark_pending_removal_oldest_first() {
        let now = Utc::now();
        // five stacks, all idle for 10 minutes, created v1 oldest .. v5 newest
        let stacks: Vec<Stack> = (1..=5)
            .map(|i| idle_stack(&format!("foo-v{}", i), 3600 - i * 60, 600, now))
            .collect();
        let mut container = container_with(stacks, 3, 300);

        mark_pending_removal(&mut container, &BTreeMap::new(), now);

        let removed: Vec<&str> = container
            .stack_containers
            .values()
            .filter(|sc| sc.pending_removal)
            .map(|sc| sc.name())
            .collect();
        // the two oldest by creation time are flagged
        assert_eq!(removed, vec!["foo-v1", "foo-v2"]);
    }

    #[test]
    fn test_mark_pending_removal_respects_limit() {
        let now = Utc::now();
        let stacks: Vec<Stack> = (1..=3)
            .map(|i| idle_stack(&format!("foo-v{}", i), 3600, 600, now))
            .collect();
        let mut container = container_with(stacks, 3, 300);

        mark_pending_removal(&mut container, &BTreeMap::new(), now);
        assert!(container
            .stack_containers
            .values()
            .all(|sc| !sc.pending_removal));
    }

    #[test]
    fn test_mark_pending_removal_skips_stacks_with_traffic() {
        let now = Utc::now();
        let stacks: Vec<Stack> = (1..=4)
            .map(|i| idle_stack(&format!("foo-v{}", i), 3600 - i * 60, 600, now))
            .collect();
        let mut container = container_with(stacks, 2, 300);

        let traffic = BTreeMap::from([(
            "foo-v1".to_string(),
            TrafficStatus {
                desired_weight: 0.0,
                actual_weight: 50.0,
            },
        )]);
        mark_pending_removal(&mut container, &traffic, now);

        let removed: Vec<&str> = container
            .stack_containers
            .values()
            .filter(|sc| sc.pending_removal)
            .map(|sc| sc.name())
            .collect();
        // foo-v1 still receives traffic; the next oldest are flagged instead
        assert_eq!(removed, vec!["foo-v2", "foo-v3"]);
    }

    #[test]
    fn test_mark_pending_removal_skips_stacks_within_ttl() {
        let now = Utc::now();
        let mut stacks: Vec<Stack> = (1..=3)
            .map(|i| idle_stack(&format!("foo-v{}", i), 3600 - i * 60, 600, now))
            .collect();
        // freshly idle, within the TTL
        stacks[0] = idle_stack("foo-v1", 3600, 10, now);
        let mut container = container_with(stacks, 2, 300);

        mark_pending_removal(&mut container, &BTreeMap::new(), now);

        let removed: Vec<&str> = container
            .stack_containers
            .values()
            .filter(|sc| sc.pending_removal)
            .map(|sc| sc.name())
            .collect();
        assert_eq!(removed, vec!["foo-v2"]);
    }

    #[test]
    fn test_mark_pending_removal_requires_idle_marker() {
        let now = Utc::now();
        let spec = serde_json::from_value(serde_json::json!({
            "podTemplate": {"spec": {"containers": [{"name": "app", "image": "nginx"}]}}
        }))
        .unwrap();
        let unmarked = Stack::new("foo-v1", spec);
        let marked = idle_stack("foo-v2", 3600, 600, now);
        let mut container = container_with(vec![unmarked, marked], 1, 300);

        mark_pending_removal(&mut container, &BTreeMap::new(), now);

        let removed: Vec<&str> = container
            .stack_containers
            .values()
            .filter(|sc| sc.pending_removal)
            .map(|sc| sc.name())
            .collect();
        assert_eq!(removed, vec!["foo-v2"]);
    }
}
