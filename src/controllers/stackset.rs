//! StackSet Controller
//!
//! Drives one reconcile pass per StackSet: observed resources are assembled
//! into a container, the current stack is materialized, traffic weights are
//! computed and written onto the routing objects, child objects are
//! converged, and retired stacks are removed. The ordering is fixed so a
//! freshly created stack is never a deletion candidate in the same pass and
//! traffic is never directed at a stack whose children don't exist yet.

use crate::conditions::{
    build_condition, set_condition, CONDITION_FALSE, CONDITION_TRUE, STACKSET_CONDITION_INVALID,
    STACKSET_CONDITION_READY, STACKSET_CONDITION_STACKS_SYNCED,
};
use crate::controllers::children::{
    apply_deployment, apply_hpa, apply_service, delete_hpa, reconcile_stackset_ingress,
    reconcile_stackset_routegroup, stack_deployment, stack_hpa, stack_service, stackset_ingress,
    stackset_routegroup,
};
use crate::controllers::collector::{collect_resources, ClusterState};
use crate::controllers::container::{StackSetContainer, TrafficStatus};
use crate::controllers::lifecycle::{
    cleanup_old_stacks, create_current_stack, mark_pending_removal,
};
use crate::controllers::{
    error_policy_backoff, CONTROLLER_ANNOTATION_KEY, NO_TRAFFIC_SINCE_ANNOTATION_KEY,
};
use crate::crd::{RouteGroup, Stack, StackSet};
use crate::error::{OperatorError, Result};
use crate::traffic::{DEFAULT_BACKEND_WEIGHTS_ANNOTATION_KEY, WEIGHT_EPSILON};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Configuration of the stackset controller
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Only StackSets whose controller annotation matches (or is absent) are reconciled
    pub controller_id: Option<String>,
    /// Annotation key under which the available weights are written
    pub backend_weights_annotation_key: String,
    /// Namespace to watch; all namespaces when `None`
    pub namespace: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            controller_id: None,
            backend_weights_annotation_key: DEFAULT_BACKEND_WEIGHTS_ANNOTATION_KEY.to_string(),
            namespace: None,
        }
    }
}

/// Controller reconciling StackSet resources
pub struct StackSetController {
    client: Client,
    config: ControllerConfig,
}

impl StackSetController {
    /// Create a new stackset controller
    pub fn new(client: Client, config: ControllerConfig) -> Self {
        Self { client, config }
    }

    /// Run the stackset controller
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let stack_sets: Api<StackSet> = match &self.config.namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        };

        info!("Starting StackSet controller");

        Controller::new(stack_sets, Config::default())
            .shutdown_on_signal()
            .run(
                |stack_set, ctx| async move { ctx.reconcile(stack_set).await },
                |stack_set, error, ctx| {
                    error!("Reconciliation error: {:?}", error);
                    error_policy_backoff(stack_set, error, ctx)
                },
                Arc::clone(&self),
            )
            .for_each(|result| async move {
                match result {
                    Ok((obj, _action)) => {
                        info!("Reconciled stackset: {}", obj.name);
                    }
                    Err(e) => {
                        error!("Reconciliation failed: {:?}", e);
                    }
                }
            })
            .await;

        Ok(())
    }

    fn reconciles(&self, stack_set: &StackSet) -> bool {
        match stack_set
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(CONTROLLER_ANNOTATION_KEY))
        {
            None => true,
            Some(id) => self.config.controller_id.as_deref() == Some(id.as_str()),
        }
    }

    /// Reconcile a single StackSet
    async fn reconcile(
        &self,
        stack_set: Arc<StackSet>,
    ) -> std::result::Result<Action, OperatorError> {
        let name = stack_set.name_any();
        let namespace = stack_set
            .namespace()
            .unwrap_or_else(|| "default".to_string());

        if !self.reconciles(&stack_set) {
            return Ok(Action::await_change());
        }

        info!("Reconciling StackSet {}/{}", namespace, name);

        let state = self.observe(&namespace).await?;
        let mut containers =
            collect_resources(state, self.config.controller_id.as_deref());

        let Some(uid) = stack_set.metadata.uid.clone() else {
            return Ok(Action::await_change());
        };
        let Some(mut container) = containers.remove(&uid) else {
            // the cache hasn't caught up yet
            return Ok(Action::requeue(Duration::from_secs(5)));
        };

        let now = Utc::now();

        // materialize the current template version
        let mut invalid_reason = None;
        match create_current_stack(&self.client, &mut container).await {
            Ok(()) => {}
            Err(OperatorError::InvalidStackSet(msg)) => {
                warn!("StackSet {}/{} is invalid: {}", namespace, name, msg);
                invalid_reason = Some(msg);
            }
            Err(e) => return Err(e),
        }

        let traffic = container.traffic_status(&self.config.backend_weights_annotation_key);

        self.reconcile_traffic_markers(&namespace, &mut container, &traffic, now)
            .await?;

        mark_pending_removal(&mut container, &traffic, now);

        let (available, desired) = container
            .traffic_reconciler
            .reconcile_traffic(&container.stack_containers, &traffic);

        self.reconcile_stack_children(&namespace, &container, &traffic, now)
            .await?;

        self.reconcile_routing(&namespace, &container, &available, &desired, now)
            .await?;

        cleanup_old_stacks(&self.client, &container).await?;

        self.update_status(&namespace, &container, invalid_reason)
            .await?;

        Ok(Action::requeue(Duration::from_secs(60)))
    }

    /// List all resources of the namespace the pass operates on.
    async fn observe(&self, namespace: &str) -> Result<ClusterState> {
        let lp = ListParams::default();

        let stack_sets: Api<StackSet> = Api::namespaced(self.client.clone(), namespace);
        let stacks: Api<Stack> = Api::namespaced(self.client.clone(), namespace);
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let hpas: Api<HorizontalPodAutoscaler> = Api::namespaced(self.client.clone(), namespace);
        let ingresses: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        let route_groups: Api<RouteGroup> = Api::namespaced(self.client.clone(), namespace);

        Ok(ClusterState {
            stack_sets: stack_sets.list(&lp).await?.items,
            stacks: stacks.list(&lp).await?.items,
            deployments: deployments.list(&lp).await?.items,
            services: services.list(&lp).await?.items,
            hpas: hpas.list(&lp).await?.items,
            ingresses: ingresses.list(&lp).await?.items,
            route_groups: route_groups.list(&lp).await?.items,
        })
    }

    /// Maintains the no-traffic marker on every stack of the family. The
    /// lifecycle TTL is measured against this marker.
    async fn reconcile_traffic_markers(
        &self,
        namespace: &str,
        container: &mut StackSetContainer,
        traffic: &std::collections::BTreeMap<String, TrafficStatus>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let stacks: Api<Stack> = Api::namespaced(self.client.clone(), namespace);

        for sc in container.stack_containers.values_mut() {
            let name = sc.name().to_string();
            let status = traffic.get(&name).copied().unwrap_or_default();
            let has_traffic = status.desired_weight > WEIGHT_EPSILON
                || status.actual_weight > WEIGHT_EPSILON;

            let annotations = sc
                .stack
                .metadata
                .annotations
                .get_or_insert_with(Default::default);
            let marked = annotations.contains_key(NO_TRAFFIC_SINCE_ANNOTATION_KEY);

            if has_traffic && marked {
                let patch = serde_json::json!({
                    "metadata": {
                        "annotations": {
                            NO_TRAFFIC_SINCE_ANNOTATION_KEY: serde_json::Value::Null,
                        }
                    }
                });
                stacks
                    .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                    .map_err(|e| OperatorError::KubeApi(e.to_string()))?;
                annotations.remove(NO_TRAFFIC_SINCE_ANNOTATION_KEY);
            } else if !has_traffic && !marked {
                let stamp = now.to_rfc3339();
                let patch = serde_json::json!({
                    "metadata": {
                        "annotations": {
                            NO_TRAFFIC_SINCE_ANNOTATION_KEY: stamp,
                        }
                    }
                });
                stacks
                    .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                    .map_err(|e| OperatorError::KubeApi(e.to_string()))?;
                annotations.insert(NO_TRAFFIC_SINCE_ANNOTATION_KEY.to_string(), stamp);
            }
        }

        Ok(())
    }

    /// Converges Deployment, Service and HPA for every stack of the family.
    async fn reconcile_stack_children(
        &self,
        namespace: &str,
        container: &StackSetContainer,
        traffic: &std::collections::BTreeMap<String, TrafficStatus>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        for sc in container.stack_containers.values() {
            if sc.pending_removal {
                continue;
            }
            let stack = &sc.stack;

            let mut deployment = stack_deployment(stack, sc.resources.deployment.as_ref());
            container.traffic_reconciler.reconcile_deployment(
                &container.stack_containers,
                stack,
                traffic,
                &mut deployment,
                now,
            )?;

            match stack_hpa(stack) {
                Some(mut hpa) => {
                    container.traffic_reconciler.reconcile_hpa(
                        stack,
                        &mut hpa,
                        &mut deployment,
                        sc.resources.hpa.as_ref(),
                        now,
                    )?;
                    apply_deployment(&self.client, namespace, &deployment).await?;
                    apply_hpa(&self.client, namespace, &hpa).await?;
                }
                None => {
                    apply_deployment(&self.client, namespace, &deployment).await?;
                    if sc.resources.hpa.is_some() {
                        delete_hpa(&self.client, namespace, sc.name()).await?;
                    }
                }
            }

            apply_service(&self.client, namespace, &stack_service(stack)).await?;
        }

        Ok(())
    }

    /// Converges the top-level routing objects, writing the weight vectors.
    async fn reconcile_routing(
        &self,
        namespace: &str,
        container: &StackSetContainer,
        available: &std::collections::BTreeMap<String, f64>,
        desired: &std::collections::BTreeMap<String, f64>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let stack_set = &container.stack_set;

        if let (Some(ingress_spec), Some(rg_spec)) =
            (&stack_set.spec.ingress, &stack_set.spec.route_group)
        {
            if ingress_spec
                .hosts
                .iter()
                .any(|h| rg_spec.hosts.contains(h))
            {
                warn!(
                    "StackSet {}/{} declares overlapping hostnames on ingress and routegroup",
                    namespace,
                    stack_set.metadata.name.as_deref().unwrap_or_default()
                );
            }
        }

        let ingress_target = stackset_ingress(
            stack_set,
            available,
            desired,
            &self.config.backend_weights_annotation_key,
            now,
        )?;
        let rg_target = stackset_routegroup(
            stack_set,
            available,
            desired,
            &self.config.backend_weights_annotation_key,
            now,
        )?;

        reconcile_stackset_ingress(&self.client, namespace, container, ingress_target, now)
            .await?;
        reconcile_stackset_routegroup(&self.client, namespace, container, rg_target, now).await?;

        Ok(())
    }

    /// Writes the StackSet status: stack counts, observed version, conditions.
    async fn update_status(
        &self,
        namespace: &str,
        container: &StackSetContainer,
        invalid_reason: Option<String>,
    ) -> Result<()> {
        let name = container
            .stack_set
            .metadata
            .name
            .clone()
            .unwrap_or_default();
        let stack_sets: Api<StackSet> = Api::namespaced(self.client.clone(), namespace);

        let total = container.stack_containers.len() as i32;
        let ready = container
            .stack_containers
            .values()
            .filter(|sc| {
                sc.resources.deployment.as_ref().is_some_and(|d| {
                    let desired = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
                    let ready = d.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0);
                    ready > 0 && ready >= desired
                })
            })
            .count() as i32;

        let mut cond_fields = Vec::new();

        let (ready_status, ready_reason, ready_msg) = if total > 0 && ready == total {
            (
                CONDITION_TRUE,
                "AllStacksReady",
                format!("{}/{} stacks ready", ready, total),
            )
        } else {
            (
                CONDITION_FALSE,
                "StacksNotReady",
                format!("{}/{} stacks ready", ready, total),
            )
        };
        set_condition(
            &mut cond_fields,
            build_condition(STACKSET_CONDITION_READY, ready_status, ready_reason, &ready_msg),
        );

        let template_version = &container.stack_set.spec.stack_template.spec.version;
        let observed_version = container
            .stack_set
            .status
            .as_ref()
            .map(|s| s.observed_stack_version.as_str())
            .unwrap_or_default();
        let (synced_status, synced_reason, synced_msg) = if observed_version
            == template_version.as_str()
        {
            (
                CONDITION_TRUE,
                "VersionObserved",
                format!("stack version {} materialized", template_version),
            )
        } else {
            (
                CONDITION_FALSE,
                "VersionPending",
                format!("stack version {} not yet materialized", template_version),
            )
        };
        set_condition(
            &mut cond_fields,
            build_condition(
                STACKSET_CONDITION_STACKS_SYNCED,
                synced_status,
                synced_reason,
                &synced_msg,
            ),
        );

        let (invalid_status, invalid_reason_str, invalid_msg) = match &invalid_reason {
            Some(msg) => (CONDITION_TRUE, "InvalidTemplate", msg.clone()),
            None => (
                CONDITION_FALSE,
                "Valid",
                "Stack template is valid".to_string(),
            ),
        };
        set_condition(
            &mut cond_fields,
            build_condition(
                STACKSET_CONDITION_INVALID,
                invalid_status,
                invalid_reason_str,
                &invalid_msg,
            ),
        );

        let conditions: Vec<_> = cond_fields
            .into_iter()
            .map(|c| c.into_stackset_condition())
            .collect();

        let observed_stack_version = container
            .stack_set
            .status
            .as_ref()
            .map(|s| s.observed_stack_version.clone())
            .unwrap_or_default();

        let patch = serde_json::json!({
            "status": {
                "stacks": total,
                "readyStacks": ready,
                "observedStackVersion": observed_stack_version,
                "conditions": conditions,
            }
        });

        stack_sets
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| OperatorError::KubeApi(e.to_string()))?;

        Ok(())
    }
}
