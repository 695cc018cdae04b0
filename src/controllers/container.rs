//! Per-pass containers assembling a StackSet with its observed resources
//!
//! Containers are ephemeral: they are rebuilt from scratch on every reconcile
//! pass and never shared between passes. The cluster object store is the
//! single source of truth.

use crate::controllers::reconciler::TrafficReconciler;
use crate::crd::{RouteGroup, Stack, StackSet};
use crate::traffic::{parse_weight_annotation, STACK_TRAFFIC_WEIGHTS_ANNOTATION_KEY};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use std::collections::BTreeMap;

/// Desired and actual traffic weight of one stack
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrafficStatus {
    /// Weight the operator declared for this stack
    pub desired_weight: f64,
    /// Weight the router currently honours
    pub actual_weight: f64,
}

/// Child resources resolved for one stack
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StackResources {
    pub deployment: Option<Deployment>,
    pub service: Option<Service>,
    pub hpa: Option<HorizontalPodAutoscaler>,
    pub ingress: Option<Ingress>,
    pub route_group: Option<RouteGroup>,
}

/// One stack with its resolved child resources
#[derive(Debug, Clone, PartialEq)]
pub struct StackContainer {
    pub stack: Stack,
    pub resources: StackResources,
    /// Marked by the lifecycle policy; the stack is deleted at the end of the pass
    pub pending_removal: bool,
}

impl StackContainer {
    pub fn new(stack: Stack) -> Self {
        Self {
            stack,
            resources: StackResources::default(),
            pending_removal: false,
        }
    }

    /// Name of the underlying stack
    pub fn name(&self) -> &str {
        self.stack.metadata.name.as_deref().unwrap_or_default()
    }
}

/// A StackSet with all stacks of its family, keyed by stack UID
#[derive(Debug, Clone, PartialEq)]
pub struct StackSetContainer {
    pub stack_set: StackSet,
    pub stack_containers: BTreeMap<String, StackContainer>,
    /// Top-level ingress owned by the StackSet itself
    pub ingress: Option<Ingress>,
    /// Top-level routegroup owned by the StackSet itself
    pub route_group: Option<RouteGroup>,
    /// Traffic policy chosen for this family
    pub traffic_reconciler: TrafficReconciler,
}

impl StackSetContainer {
    /// Assembles the per-stack traffic status for this pass.
    ///
    /// Desired weights come from `spec.traffic` when set; otherwise the
    /// desired-weights annotation on the top-level routing object is read
    /// back. Actual weights come from the backend-weights annotation under
    /// the configured key. Every stack of the family gets an entry.
    pub fn traffic_status(&self, backend_weights_key: &str) -> BTreeMap<String, TrafficStatus> {
        let desired = self.desired_weights();
        let actual = self.annotation_weights(backend_weights_key);

        let mut traffic = BTreeMap::new();
        for sc in self.stack_containers.values() {
            let name = sc.name().to_string();
            traffic.insert(
                name.clone(),
                TrafficStatus {
                    desired_weight: desired.get(&name).copied().unwrap_or(0.0),
                    actual_weight: actual.get(&name).copied().unwrap_or(0.0),
                },
            );
        }
        traffic
    }

    fn desired_weights(&self) -> BTreeMap<String, f64> {
        if let Some(traffic) = &self.stack_set.spec.traffic {
            if !traffic.is_empty() {
                return traffic
                    .iter()
                    .map(|t| (t.stack_name.clone(), t.weight))
                    .collect();
            }
        }
        self.annotation_weights(STACK_TRAFFIC_WEIGHTS_ANNOTATION_KEY)
    }

    fn annotation_weights(&self, key: &str) -> BTreeMap<String, f64> {
        for annotations in [
            self.ingress
                .as_ref()
                .and_then(|i| i.metadata.annotations.as_ref()),
            self.route_group
                .as_ref()
                .and_then(|r| r.metadata.annotations.as_ref()),
        ]
        .into_iter()
        .flatten()
        {
            if let Some(weights) = parse_weight_annotation(annotations, key) {
                return weights;
            }
        }
        BTreeMap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{DesiredTraffic, StackSetSpec, StackSpec};
    use k8s_openapi::api::core::v1::PodTemplateSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn test_stack(name: &str) -> Stack {
        Stack {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: StackSpec {
                replicas: Some(1),
                pod_template: PodTemplateSpec::default(),
                horizontal_pod_autoscaler: None,
                service: None,
            },
            status: None,
        }
    }

    fn test_container(traffic: Option<Vec<DesiredTraffic>>, stacks: &[&str]) -> StackSetContainer {
        let spec: StackSetSpec = serde_json::from_value(serde_json::json!({
            "stackTemplate": {
                "spec": {
                    "version": "v1",
                    "podTemplate": {"spec": {"containers": [{"name": "app", "image": "nginx"}]}}
                }
            }
        }))
        .unwrap();
        let mut stack_set = StackSet::new("foo", spec);
        stack_set.spec.traffic = traffic;
        let stack_containers = stacks
            .iter()
            .enumerate()
            .map(|(i, name)| (format!("uid-{}", i), StackContainer::new(test_stack(name))))
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
    fn test_traffic_status_from_spec() {
        let container = test_container(
            Some(vec![
                DesiredTraffic {
                    stack_name: "foo-v1".to_string(),
                    weight: 30.0,
                },
                DesiredTraffic {
                    stack_name: "foo-v2".to_string(),
                    weight: 70.0,
                },
            ]),
            &["foo-v1", "foo-v2"],
        );

        let traffic = container.traffic_status("zalando.org/backend-weights");
        assert_eq!(traffic["foo-v1"].desired_weight, 30.0);
        assert_eq!(traffic["foo-v2"].desired_weight, 70.0);
        assert_eq!(traffic["foo-v1"].actual_weight, 0.0);
    }

    #[test]
    fn test_traffic_status_falls_back_to_annotations() {
        let mut container = test_container(None, &["foo-v1", "foo-v2"]);
        let mut annotations = BTreeMap::new();
        annotations.insert(
            STACK_TRAFFIC_WEIGHTS_ANNOTATION_KEY.to_string(),
            r#"{"foo-v1": 20.0, "foo-v2": 80.0}"#.to_string(),
        );
        annotations.insert(
            "zalando.org/backend-weights".to_string(),
            r#"{"foo-v1": 100.0}"#.to_string(),
        );
        container.ingress = Some(Ingress {
            metadata: ObjectMeta {
                name: Some("foo".to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            ..Default::default()
        });

        let traffic = container.traffic_status("zalando.org/backend-weights");
        assert_eq!(traffic["foo-v1"].desired_weight, 20.0);
        assert_eq!(traffic["foo-v2"].desired_weight, 80.0);
        assert_eq!(traffic["foo-v1"].actual_weight, 100.0);
        assert_eq!(traffic["foo-v2"].actual_weight, 0.0);
    }

    #[test]
    fn test_traffic_status_every_stack_has_entry() {
        let container = test_container(
            Some(vec![DesiredTraffic {
                stack_name: "foo-v2".to_string(),
                weight: 100.0,
            }]),
            &["foo-v1", "foo-v2", "foo-v3"],
        );
        let traffic = container.traffic_status("zalando.org/backend-weights");
        assert_eq!(traffic.len(), 3);
        assert_eq!(traffic["foo-v1"].desired_weight, 0.0);
        assert_eq!(traffic["foo-v3"].desired_weight, 0.0);
    }
}
