//! Child-object reconciliation
//!
//! Computes the target Deployment, Service and HPA for each stack and the
//! target Ingress/RouteGroup for each StackSet, and converges the cluster
//! towards them. Routing objects carry the weight annotations and an
//! updated-timestamp used for the cross-object deletion grace window.

use crate::controllers::container::StackSetContainer;
use crate::controllers::{
    FIELD_MANAGER, STACKSET_HERITAGE_LABEL_KEY, STACK_VERSION_LABEL_KEY,
    UPDATED_TIMESTAMP_ANNOTATION_KEY,
};
use crate::crd::{
    RouteGroup, RouteGroupBackend, RouteGroupBackendReference, RouteGroupRouteSpec, RouteGroupSpec,
    Stack, StackSet,
};
use crate::error::{OperatorError, Result};
use crate::traffic::{STACK_TRAFFIC_WEIGHTS_ANNOTATION_KEY, WEIGHT_EPSILON};
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec, MetricSpec,
    MetricTarget, ResourceMetricSource,
};
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Minimum age of a replacement routing object before its predecessor may be
/// deleted.
pub const ROUTING_OBJECT_DELETION_GRACE_SECONDS: i64 = 60;

/// Owner reference pointing at a StackSet
pub fn stackset_owner_reference(stack_set: &StackSet) -> OwnerReference {
    OwnerReference {
        api_version: StackSet::api_version(&()).to_string(),
        kind: StackSet::kind(&()).to_string(),
        name: stack_set.metadata.name.clone().unwrap_or_default(),
        uid: stack_set.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Owner reference pointing at a Stack
pub fn stack_owner_reference(stack: &Stack) -> OwnerReference {
    OwnerReference {
        api_version: Stack::api_version(&()).to_string(),
        kind: Stack::kind(&()).to_string(),
        name: stack.metadata.name.clone().unwrap_or_default(),
        uid: stack.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

fn pod_selector(stack: &Stack) -> BTreeMap<String, String> {
    let mut selector = BTreeMap::new();
    let empty = BTreeMap::new();
    let labels = stack.metadata.labels.as_ref().unwrap_or(&empty);
    match (
        labels.get(STACKSET_HERITAGE_LABEL_KEY),
        labels.get(STACK_VERSION_LABEL_KEY),
    ) {
        (Some(heritage), Some(version)) => {
            selector.insert(STACKSET_HERITAGE_LABEL_KEY.to_string(), heritage.clone());
            selector.insert(STACK_VERSION_LABEL_KEY.to_string(), version.clone());
        }
        _ => {
            selector.insert(
                "stack".to_string(),
                stack.metadata.name.clone().unwrap_or_default(),
            );
        }
    }
    selector
}

/// Builds the target Deployment for a stack.
///
/// Prescaling state annotations carried by the live deployment survive the
/// rebuild; everything else is derived from the stack spec. When the stack
/// has an autoscaler the live replica count is kept so the controller doesn't
/// fight the HPA.
pub fn stack_deployment(stack: &Stack, existing: Option<&Deployment>) -> Deployment {
    use crate::controllers::prescale::{
        PRESCALE_ANNOTATION_KEY, PRESCALE_REMOVED_AT_ANNOTATION_KEY,
    };

    let name = stack.metadata.name.clone().unwrap_or_default();
    let labels = stack.metadata.labels.clone().unwrap_or_default();
    let selector = pod_selector(stack);

    let mut pod_template = stack.spec.pod_template.clone();
    let template_labels = pod_template
        .metadata
        .get_or_insert_with(Default::default)
        .labels
        .get_or_insert_with(BTreeMap::new);
    for (k, v) in &selector {
        template_labels.insert(k.clone(), v.clone());
    }

    let mut annotations = BTreeMap::new();
    if let Some(existing_annotations) = existing.and_then(|d| d.metadata.annotations.as_ref()) {
        for key in [PRESCALE_ANNOTATION_KEY, PRESCALE_REMOVED_AT_ANNOTATION_KEY] {
            if let Some(value) = existing_annotations.get(key) {
                annotations.insert(key.to_string(), value.clone());
            }
        }
    }

    let replicas = if stack.spec.horizontal_pod_autoscaler.is_some() {
        existing.and_then(|d| d.spec.as_ref()).and_then(|s| s.replicas)
    } else {
        stack.spec.replicas
    };

    Deployment {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: stack.metadata.namespace.clone(),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: Some(vec![stack_owner_reference(stack)]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas,
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template: pod_template,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Builds the target Service for a stack. Ports fall back to the container
/// ports when the stack declares none.
pub fn stack_service(stack: &Stack) -> Service {
    let name = stack.metadata.name.clone().unwrap_or_default();
    let labels = stack.metadata.labels.clone().unwrap_or_default();
    let selector = pod_selector(stack);

    let mut ports: Vec<ServicePort> = stack
        .spec
        .service
        .as_ref()
        .map(|s| s.ports.clone())
        .unwrap_or_default();

    if ports.is_empty() {
        for container in stack
            .spec
            .pod_template
            .spec
            .as_ref()
            .map(|s| s.containers.as_slice())
            .unwrap_or_default()
        {
            for port in container.ports.as_deref().unwrap_or_default() {
                ports.push(ServicePort {
                    name: port.name.clone(),
                    port: port.container_port,
                    ..Default::default()
                });
            }
        }
    }
    if ports.is_empty() {
        ports.push(ServicePort {
            port: 80,
            ..Default::default()
        });
    }

    Service {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: stack.metadata.namespace.clone(),
            labels: Some(labels),
            owner_references: Some(vec![stack_owner_reference(stack)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Builds the target HPA for a stack, if the stack declares an autoscaler.
pub fn stack_hpa(stack: &Stack) -> Option<HorizontalPodAutoscaler> {
    let autoscaler = stack.spec.horizontal_pod_autoscaler.as_ref()?;
    let name = stack.metadata.name.clone().unwrap_or_default();
    let labels = stack.metadata.labels.clone().unwrap_or_default();

    let metrics = vec![MetricSpec {
        type_: "Resource".to_string(),
        resource: Some(ResourceMetricSource {
            name: "cpu".to_string(),
            target: MetricTarget {
                type_: "Utilization".to_string(),
                average_utilization: Some(autoscaler.target_cpu_utilization_percentage),
                ..Default::default()
            },
        }),
        ..Default::default()
    }];

    Some(HorizontalPodAutoscaler {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: stack.metadata.namespace.clone(),
            labels: Some(labels),
            owner_references: Some(vec![stack_owner_reference(stack)]),
            ..Default::default()
        },
        spec: Some(HorizontalPodAutoscalerSpec {
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some("apps/v1".to_string()),
                kind: "Deployment".to_string(),
                name,
            },
            min_replicas: autoscaler.min_replicas,
            max_replicas: autoscaler.max_replicas,
            metrics: Some(metrics),
            behavior: None,
        }),
        status: None,
    })
}

fn routing_annotations(
    extra: &BTreeMap<String, String>,
    desired: &BTreeMap<String, f64>,
    available: &BTreeMap<String, f64>,
    backend_weights_key: &str,
    now: DateTime<Utc>,
) -> Result<BTreeMap<String, String>> {
    let mut annotations = extra.clone();
    annotations.insert(
        STACK_TRAFFIC_WEIGHTS_ANNOTATION_KEY.to_string(),
        serde_json::to_string(desired)?,
    );
    annotations.insert(
        backend_weights_key.to_string(),
        serde_json::to_string(available)?,
    );
    annotations.insert(
        UPDATED_TIMESTAMP_ANNOTATION_KEY.to_string(),
        now.to_rfc3339(),
    );
    Ok(annotations)
}

fn backend_names(
    available: &BTreeMap<String, f64>,
    desired: &BTreeMap<String, f64>,
) -> Vec<String> {
    let weighted: Vec<String> = available
        .iter()
        .filter(|(_, w)| **w > WEIGHT_EPSILON)
        .map(|(name, _)| name.clone())
        .collect();
    if !weighted.is_empty() {
        return weighted;
    }
    desired.keys().cloned().collect()
}

/// Builds the target top-level Ingress, carrying the weight annotations. One
/// path entry is generated per backend stack; the external router splits the
/// traffic according to the backend-weights annotation.
pub fn stackset_ingress(
    stack_set: &StackSet,
    available: &BTreeMap<String, f64>,
    desired: &BTreeMap<String, f64>,
    backend_weights_key: &str,
    now: DateTime<Utc>,
) -> Result<Option<Ingress>> {
    let Some(ingress_spec) = &stack_set.spec.ingress else {
        return Ok(None);
    };

    let name = stack_set.metadata.name.clone().unwrap_or_default();
    let annotations = routing_annotations(
        &ingress_spec.annotations,
        desired,
        available,
        backend_weights_key,
        now,
    )?;

    let path = ingress_spec.path.clone().unwrap_or_else(|| "/".to_string());
    let backends = backend_names(available, desired);
    if backends.is_empty() {
        // no stacks yet, nothing to route to
        return Ok(None);
    }

    let paths: Vec<HTTPIngressPath> = backends
        .iter()
        .map(|backend| HTTPIngressPath {
            path: Some(path.clone()),
            path_type: "ImplementationSpecific".to_string(),
            backend: IngressBackend {
                service: Some(IngressServiceBackend {
                    name: backend.clone(),
                    port: Some(ServiceBackendPort {
                        number: Some(ingress_spec.backend_port),
                        ..Default::default()
                    }),
                }),
                ..Default::default()
            },
        })
        .collect();

    let rules: Vec<IngressRule> = ingress_spec
        .hosts
        .iter()
        .map(|host| IngressRule {
            host: Some(host.clone()),
            http: Some(HTTPIngressRuleValue {
                paths: paths.clone(),
            }),
        })
        .collect();

    Ok(Some(Ingress {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: stack_set.metadata.namespace.clone(),
            annotations: Some(annotations),
            owner_references: Some(vec![stackset_owner_reference(stack_set)]),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            rules: Some(rules),
            ..Default::default()
        }),
        status: None,
    }))
}

/// Builds the target top-level RouteGroup, carrying the weight annotations.
pub fn stackset_routegroup(
    stack_set: &StackSet,
    available: &BTreeMap<String, f64>,
    desired: &BTreeMap<String, f64>,
    backend_weights_key: &str,
    now: DateTime<Utc>,
) -> Result<Option<RouteGroup>> {
    let Some(rg_spec) = &stack_set.spec.route_group else {
        return Ok(None);
    };

    let name = stack_set.metadata.name.clone().unwrap_or_default();
    let annotations = routing_annotations(
        &rg_spec.annotations,
        desired,
        available,
        backend_weights_key,
        now,
    )?;

    let backend_list = backend_names(available, desired);
    if backend_list.is_empty() {
        // no stacks yet, nothing to route to
        return Ok(None);
    }
    let backends: Vec<RouteGroupBackend> = backend_list
        .iter()
        .map(|backend| RouteGroupBackend {
            name: backend.clone(),
            r#type: "service".to_string(),
            service_name: Some(backend.clone()),
            service_port: Some(rg_spec.backend_port),
        })
        .collect();

    let default_backends: Vec<RouteGroupBackendReference> = backend_list
        .iter()
        .map(|backend| RouteGroupBackendReference {
            backend_name: backend.clone(),
            weight: available
                .get(backend)
                .copied()
                .unwrap_or(0.0)
                .round() as i64,
        })
        .collect();

    Ok(Some(RouteGroup {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: stack_set.metadata.namespace.clone(),
            annotations: Some(annotations),
            owner_references: Some(vec![stackset_owner_reference(stack_set)]),
            ..Default::default()
        },
        spec: RouteGroupSpec {
            hosts: rg_spec.hosts.clone(),
            backends,
            default_backends,
            routes: vec![RouteGroupRouteSpec {
                path_subtree: Some("/".to_string()),
                path: None,
            }],
        },
    }))
}

/// Decides whether a routing object pending deletion may actually be removed.
///
/// The counterpart (the replacement routing object) must exist and carry an
/// updated-timestamp older than the grace window. A missing counterpart, a
/// missing timestamp, or an unparseable one all keep the object, so there is
/// never a window in which neither route exists.
pub fn counterpart_allows_removal(counterpart: Option<&ObjectMeta>, now: DateTime<Utc>) -> bool {
    let Some(meta) = counterpart else {
        return false;
    };
    let Some(raw) = meta
        .annotations
        .as_ref()
        .and_then(|a| a.get(UPDATED_TIMESTAMP_ANNOTATION_KEY))
    else {
        return false;
    };
    let Ok(updated) = DateTime::parse_from_rfc3339(raw) else {
        return false;
    };
    now.signed_duration_since(updated.with_timezone(&Utc))
        >= chrono::Duration::seconds(ROUTING_OBJECT_DELETION_GRACE_SECONDS)
}

/// Creates or updates the Deployment for a stack.
pub async fn apply_deployment(
    client: &Client,
    namespace: &str,
    deployment: &Deployment,
) -> Result<()> {
    let name = deployment.metadata.name.clone().unwrap_or_default();
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);

    match deployments.get(&name).await {
        Ok(_existing) => {
            deployments
                .patch(
                    &name,
                    &PatchParams::apply(FIELD_MANAGER),
                    &Patch::Apply(deployment),
                )
                .await
                .map_err(|e| OperatorError::KubeApi(e.to_string()))?;
        }
        Err(_) => {
            deployments
                .create(&PostParams::default(), deployment)
                .await
                .map_err(|e| OperatorError::KubeApi(e.to_string()))?;
        }
    }
    Ok(())
}

/// Creates or updates the Service for a stack.
pub async fn apply_service(client: &Client, namespace: &str, service: &Service) -> Result<()> {
    let name = service.metadata.name.clone().unwrap_or_default();
    let services: Api<Service> = Api::namespaced(client.clone(), namespace);

    match services.get(&name).await {
        Ok(_existing) => {
            services
                .patch(
                    &name,
                    &PatchParams::apply(FIELD_MANAGER),
                    &Patch::Apply(service),
                )
                .await
                .map_err(|e| OperatorError::KubeApi(e.to_string()))?;
        }
        Err(_) => {
            services
                .create(&PostParams::default(), service)
                .await
                .map_err(|e| OperatorError::KubeApi(e.to_string()))?;
        }
    }
    Ok(())
}

/// Creates or updates the HPA for a stack.
pub async fn apply_hpa(
    client: &Client,
    namespace: &str,
    hpa: &HorizontalPodAutoscaler,
) -> Result<()> {
    let name = hpa.metadata.name.clone().unwrap_or_default();
    let hpas: Api<HorizontalPodAutoscaler> = Api::namespaced(client.clone(), namespace);

    match hpas.get(&name).await {
        Ok(_existing) => {
            hpas.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Apply(hpa))
                .await
                .map_err(|e| OperatorError::KubeApi(e.to_string()))?;
        }
        Err(_) => {
            hpas.create(&PostParams::default(), hpa)
                .await
                .map_err(|e| OperatorError::KubeApi(e.to_string()))?;
        }
    }
    Ok(())
}

/// Deletes the HPA of a stack that no longer declares an autoscaler.
pub async fn delete_hpa(client: &Client, namespace: &str, name: &str) -> Result<()> {
    let hpas: Api<HorizontalPodAutoscaler> = Api::namespaced(client.clone(), namespace);
    match hpas.delete(name, &Default::default()).await {
        Ok(_) => {
            info!("Deleted HPA {}/{}", namespace, name);
        }
        Err(kube::Error::Api(e)) if e.code == 404 => {
            debug!("HPA {}/{} does not exist, nothing to delete", namespace, name);
        }
        Err(e) => {
            warn!("Failed to delete HPA {}/{}: {}", namespace, name, e);
        }
    }
    Ok(())
}

/// Converges the top-level Ingress: upsert when the StackSet declares one,
/// delete otherwise. During a migration the delete waits until the
/// replacement routegroup has been in place longer than the grace window.
pub async fn reconcile_stackset_ingress(
    client: &Client,
    namespace: &str,
    container: &StackSetContainer,
    target: Option<Ingress>,
    now: DateTime<Utc>,
) -> Result<()> {
    let name = container
        .stack_set
        .metadata
        .name
        .clone()
        .unwrap_or_default();
    let ingresses: Api<Ingress> = Api::namespaced(client.clone(), namespace);

    match (target, container.ingress.as_ref()) {
        (Some(target), Some(_existing)) => {
            ingresses
                .patch(
                    &name,
                    &PatchParams::apply(FIELD_MANAGER),
                    &Patch::Apply(&target),
                )
                .await
                .map_err(|e| OperatorError::KubeApi(e.to_string()))?;
        }
        (Some(target), None) => {
            ingresses
                .create(&PostParams::default(), &target)
                .await
                .map_err(|e| OperatorError::KubeApi(e.to_string()))?;
        }
        (None, Some(_existing)) => {
            let migrating = container.stack_set.spec.route_group.is_some();
            let counterpart = container.route_group.as_ref().map(|r| &r.metadata);
            if !migrating || counterpart_allows_removal(counterpart, now) {
                match ingresses.delete(&name, &Default::default()).await {
                    Ok(_) => info!("Deleted ingress {}/{}", namespace, name),
                    Err(kube::Error::Api(e)) if e.code == 404 => {
                        debug!("Ingress {}/{} already gone", namespace, name);
                    }
                    Err(e) => {
                        warn!("Failed to delete ingress {}/{}: {}", namespace, name, e);
                    }
                }
            } else {
                debug!(
                    "Keeping ingress {}/{} until the routegroup outlives the grace window",
                    namespace, name
                );
            }
        }
        (None, None) => {}
    }
    Ok(())
}

/// Converges the top-level RouteGroup; symmetric to the ingress rule.
pub async fn reconcile_stackset_routegroup(
    client: &Client,
    namespace: &str,
    container: &StackSetContainer,
    target: Option<RouteGroup>,
    now: DateTime<Utc>,
) -> Result<()> {
    let name = container
        .stack_set
        .metadata
        .name
        .clone()
        .unwrap_or_default();
    let route_groups: Api<RouteGroup> = Api::namespaced(client.clone(), namespace);

    match (target, container.route_group.as_ref()) {
        (Some(target), Some(_existing)) => {
            route_groups
                .patch(
                    &name,
                    &PatchParams::apply(FIELD_MANAGER),
                    &Patch::Apply(&target),
                )
                .await
                .map_err(|e| OperatorError::KubeApi(e.to_string()))?;
        }
        (Some(target), None) => {
            route_groups
                .create(&PostParams::default(), &target)
                .await
                .map_err(|e| OperatorError::KubeApi(e.to_string()))?;
        }
        (None, Some(_existing)) => {
            let migrating = container.stack_set.spec.ingress.is_some();
            let counterpart = container.ingress.as_ref().map(|i| &i.metadata);
            if !migrating || counterpart_allows_removal(counterpart, now) {
                match route_groups.delete(&name, &Default::default()).await {
                    Ok(_) => info!("Deleted routegroup {}/{}", namespace, name),
                    Err(kube::Error::Api(e)) if e.code == 404 => {
                        debug!("Routegroup {}/{} already gone", namespace, name);
                    }
                    Err(e) => {
                        warn!("Failed to delete routegroup {}/{}: {}", namespace, name, e);
                    }
                }
            } else {
                debug!(
                    "Keeping routegroup {}/{} until the ingress outlives the grace window",
                    namespace, name
                );
            }
        }
        (None, None) => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::prescale::PRESCALE_ANNOTATION_KEY;
    use crate::crd::{AutoscalerSpec, StackSpec};
    use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec, PodTemplateSpec};

    fn test_stack(name: &str) -> Stack {
        let spec = StackSpec {
            replicas: Some(3),
            pod_template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "app".to_string(),
                        image: Some("nginx".to_string()),
                        ports: Some(vec![ContainerPort {
                            container_port: 8080,
                            name: Some("http".to_string()),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            horizontal_pod_autoscaler: None,
            service: None,
        };
        let mut stack = Stack::new(name, spec);
        stack.metadata.namespace = Some("default".to_string());
        stack.metadata.uid = Some("abc1".to_string());
        stack.metadata.labels = Some(BTreeMap::from([
            (STACKSET_HERITAGE_LABEL_KEY.to_string(), "foo".to_string()),
            (STACK_VERSION_LABEL_KEY.to_string(), "v1".to_string()),
        ]));
        stack
    }

    fn test_stackset_with_ingress() -> StackSet {
        let spec = serde_json::from_value(serde_json::json!({
            "stackTemplate": {
                "spec": {
                    "version": "v1",
                    "podTemplate": {"spec": {"containers": [{"name": "app", "image": "nginx"}]}}
                }
            },
            "ingress": {"hosts": ["example.org"], "backendPort": 8080}
        }))
        .unwrap();
        let mut stack_set = StackSet::new("foo", spec);
        stack_set.metadata.namespace = Some("default".to_string());
        stack_set.metadata.uid = Some("123".to_string());
        stack_set
    }

    #[test]
    fn test_stack_deployment_basics() {
        let stack = test_stack("foo-v1");
        let deployment = stack_deployment(&stack, None);

        assert_eq!(deployment.metadata.name.as_deref(), Some("foo-v1"));
        let spec = deployment.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(3));

        let selector = spec.selector.match_labels.as_ref().unwrap();
        assert_eq!(selector[STACKSET_HERITAGE_LABEL_KEY], "foo");
        assert_eq!(selector[STACK_VERSION_LABEL_KEY], "v1");

        // pod template labels match the selector
        let pod_labels = spec
            .template
            .metadata
            .as_ref()
            .unwrap()
            .labels
            .as_ref()
            .unwrap();
        assert_eq!(pod_labels[STACKSET_HERITAGE_LABEL_KEY], "foo");

        let owner = &deployment.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "Stack");
        assert_eq!(owner.uid, "abc1");
    }

    #[test]
    fn test_stack_deployment_carries_prescale_annotations() {
        let stack = test_stack("foo-v1");
        let existing = Deployment {
            metadata: ObjectMeta {
                annotations: Some(BTreeMap::from([
                    (PRESCALE_ANNOTATION_KEY.to_string(), "4".to_string()),
                    ("unrelated".to_string(), "x".to_string()),
                ])),
                ..Default::default()
            },
            ..Default::default()
        };

        let deployment = stack_deployment(&stack, Some(&existing));
        let annotations = deployment.metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations[PRESCALE_ANNOTATION_KEY], "4");
        assert!(!annotations.contains_key("unrelated"));
    }

    #[test]
    fn test_stack_deployment_with_hpa_keeps_live_replicas() {
        let mut stack = test_stack("foo-v1");
        stack.spec.horizontal_pod_autoscaler = Some(AutoscalerSpec {
            min_replicas: Some(2),
            max_replicas: 10,
            target_cpu_utilization_percentage: 80,
        });
        let existing = Deployment {
            spec: Some(DeploymentSpec {
                replicas: Some(7),
                ..Default::default()
            }),
            ..Default::default()
        };

        let deployment = stack_deployment(&stack, Some(&existing));
        assert_eq!(deployment.spec.as_ref().unwrap().replicas, Some(7));
    }

    #[test]
    fn test_stack_service_ports_from_containers() {
        let stack = test_stack("foo-v1");
        let service = stack_service(&stack);

        let ports = service
            .spec
            .as_ref()
            .unwrap()
            .ports
            .as_ref()
            .unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].port, 8080);
        assert_eq!(ports[0].name.as_deref(), Some("http"));
    }

    #[test]
    fn test_stack_hpa_generated_only_when_declared() {
        let mut stack = test_stack("foo-v1");
        assert!(stack_hpa(&stack).is_none());

        stack.spec.horizontal_pod_autoscaler = Some(AutoscalerSpec {
            min_replicas: Some(2),
            max_replicas: 10,
            target_cpu_utilization_percentage: 70,
        });
        let hpa = stack_hpa(&stack).unwrap();
        let spec = hpa.spec.as_ref().unwrap();
        assert_eq!(spec.min_replicas, Some(2));
        assert_eq!(spec.max_replicas, 10);
        assert_eq!(spec.scale_target_ref.name, "foo-v1");
        assert_eq!(spec.scale_target_ref.kind, "Deployment");
    }

    #[test]
    fn test_stackset_ingress_weights_and_backends() {
        let stack_set = test_stackset_with_ingress();
        let available = BTreeMap::from([("foo-v1".to_string(), 0.0), ("foo-v2".to_string(), 100.0)]);
        let desired = BTreeMap::from([("foo-v1".to_string(), 0.0), ("foo-v2".to_string(), 100.0)]);
        let now = Utc::now();

        let ingress = stackset_ingress(
            &stack_set,
            &available,
            &desired,
            "zalando.org/backend-weights",
            now,
        )
        .unwrap()
        .unwrap();

        let annotations = ingress.metadata.annotations.as_ref().unwrap();
        assert_eq!(
            annotations["zalando.org/backend-weights"],
            serde_json::to_string(&available).unwrap()
        );
        assert_eq!(
            annotations[STACK_TRAFFIC_WEIGHTS_ANNOTATION_KEY],
            serde_json::to_string(&desired).unwrap()
        );
        assert_eq!(
            annotations[UPDATED_TIMESTAMP_ANNOTATION_KEY],
            now.to_rfc3339()
        );

        // only weighted backends become path entries
        let rules = ingress.spec.as_ref().unwrap().rules.as_ref().unwrap();
        assert_eq!(rules[0].host.as_deref(), Some("example.org"));
        let paths = &rules[0].http.as_ref().unwrap().paths;
        assert_eq!(paths.len(), 1);
        assert_eq!(
            paths[0].backend.service.as_ref().unwrap().name,
            "foo-v2"
        );
        assert_eq!(
            paths[0]
                .backend
                .service
                .as_ref()
                .unwrap()
                .port
                .as_ref()
                .unwrap()
                .number,
            Some(8080)
        );
    }

    #[test]
    fn test_stackset_ingress_absent_without_spec() {
        let mut stack_set = test_stackset_with_ingress();
        stack_set.spec.ingress = None;
        let result = stackset_ingress(
            &stack_set,
            &BTreeMap::new(),
            &BTreeMap::new(),
            "zalando.org/backend-weights",
            Utc::now(),
        )
        .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_stackset_routegroup_backends() {
        let mut stack_set = test_stackset_with_ingress();
        stack_set.spec.ingress = None;
        stack_set.spec.route_group = Some(
            serde_json::from_value(serde_json::json!({
                "hosts": ["example.org"],
                "backendPort": 8080
            }))
            .unwrap(),
        );

        let available = BTreeMap::from([("foo-v1".to_string(), 25.0), ("foo-v2".to_string(), 75.0)]);
        let desired = available.clone();
        let rg = stackset_routegroup(
            &stack_set,
            &available,
            &desired,
            "zalando.org/backend-weights",
            Utc::now(),
        )
        .unwrap()
        .unwrap();

        assert_eq!(rg.spec.hosts, vec!["example.org"]);
        assert_eq!(rg.spec.backends.len(), 2);
        assert_eq!(rg.spec.backends[0].service_port, Some(8080));
        assert_eq!(rg.spec.default_backends.len(), 2);
        assert_eq!(rg.spec.default_backends[0].backend_name, "foo-v1");
        assert_eq!(rg.spec.default_backends[0].weight, 25);
        assert_eq!(rg.spec.default_backends[1].weight, 75);
    }

    fn counterpart_meta(updated: Option<String>) -> ObjectMeta {
        let mut annotations = BTreeMap::new();
        if let Some(ts) = updated {
            annotations.insert(UPDATED_TIMESTAMP_ANNOTATION_KEY.to_string(), ts);
        }
        ObjectMeta {
            name: Some("foo".to_string()),
            annotations: Some(annotations),
            ..Default::default()
        }
    }

    #[test]
    fn test_grace_window_counterpart_too_young() {
        let now = Utc::now();
        let meta = counterpart_meta(Some((now - chrono::Duration::seconds(10)).to_rfc3339()));
        assert!(!counterpart_allows_removal(Some(&meta), now));
    }

    #[test]
    fn test_grace_window_counterpart_old_enough() {
        let now = Utc::now();
        let meta = counterpart_meta(Some((now - chrono::Duration::seconds(120)).to_rfc3339()));
        assert!(counterpart_allows_removal(Some(&meta), now));
    }

    #[test]
    fn test_grace_window_counterpart_missing_timestamp() {
        let now = Utc::now();
        let meta = counterpart_meta(None);
        assert!(!counterpart_allows_removal(Some(&meta), now));
    }

    #[test]
    fn test_grace_window_counterpart_invalid_timestamp() {
        let now = Utc::now();
        let meta = counterpart_meta(Some("ANotValidTimeStamp".to_string()));
        assert!(!counterpart_allows_removal(Some(&meta), now));
    }

    #[test]
    fn test_grace_window_counterpart_not_created() {
        assert!(!counterpart_allows_removal(None, Utc::now()));
    }
}
