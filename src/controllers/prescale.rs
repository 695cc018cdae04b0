//! Prescaling traffic reconciler
//!
//! Before traffic is shifted to a stack, the stack is scaled up to the
//! combined replica count of the stacks currently serving, and only admitted
//! as an available backend once that many replicas are ready. All state lives
//! in cluster annotations so the controller can restart at any moment.

use crate::controllers::container::{StackContainer, TrafficStatus};
use crate::crd::Stack;
use crate::error::Result;
use crate::traffic::{all_zero, normalize_weights, WEIGHT_EPSILON};
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::warn;

/// Annotation holding the prescale replica target on a deployment
pub const PRESCALE_ANNOTATION_KEY: &str = "stacksetstacks.zalando.org/prescale-replicas";
/// Annotation stamped when the prescale target is removed; anchors the HPA
/// floor cool-down
pub const PRESCALE_REMOVED_AT_ANNOTATION_KEY: &str =
    "stacksetstacks.zalando.org/prescale-removed-at";

/// Parses the prescale target from the deployment annotation. A malformed
/// value counts as absent.
pub fn deployment_prescale(deployment: &Deployment) -> Option<i32> {
    let raw = deployment
        .metadata
        .annotations
        .as_ref()?
        .get(PRESCALE_ANNOTATION_KEY)?;
    raw.parse().ok()
}

fn ready_replicas(deployment: &Deployment) -> i32 {
    deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0)
}

/// Health-aware traffic reconciler with a per-stack prescaling state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrescalingTrafficReconciler {
    /// Cool-down before the HPA floor relaxes after the prescale target is gone
    pub reset_hpa_min_replicas_timeout: Duration,
}

impl PrescalingTrafficReconciler {
    pub fn new(reset_hpa_min_replicas_timeout: Duration) -> Self {
        Self {
            reset_hpa_min_replicas_timeout,
        }
    }

    /// Stamps or removes the prescale annotation and pins the replica count
    /// for stacks without an autoscaler of their own.
    ///
    /// The annotation is only removed once it has served its purpose: the
    /// desired weight dropped to zero, or traffic actually arrived.
    pub fn reconcile_deployment(
        &self,
        stacks: &BTreeMap<String, StackContainer>,
        stack: &Stack,
        traffic: &BTreeMap<String, TrafficStatus>,
        deployment: &mut Deployment,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let name = stack.metadata.name.as_deref().unwrap_or_default();
        let status = traffic.get(name).copied().unwrap_or_default();
        let annotations = deployment
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new);

        if let Some(raw) = annotations.get(PRESCALE_ANNOTATION_KEY).cloned() {
            if status.desired_weight <= WEIGHT_EPSILON || status.actual_weight > WEIGHT_EPSILON {
                annotations.remove(PRESCALE_ANNOTATION_KEY);
                annotations.insert(
                    PRESCALE_REMOVED_AT_ANNOTATION_KEY.to_string(),
                    now.to_rfc3339(),
                );
                return Ok(());
            }

            if stack.spec.horizontal_pod_autoscaler.is_none() {
                match raw.parse::<i32>() {
                    Ok(replicas) => {
                        deployment
                            .spec
                            .get_or_insert_with(Default::default)
                            .replicas = Some(replicas);
                    }
                    Err(err) => {
                        warn!(stack = name, value = raw.as_str(), error = %err,
                            "Ignoring malformed prescale annotation");
                        annotations.remove(PRESCALE_ANNOTATION_KEY);
                    }
                }
            }
            return Ok(());
        }

        // prescale when the stack is asked to take traffic it doesn't yet get
        if status.desired_weight > WEIGHT_EPSILON && status.actual_weight <= WEIGHT_EPSILON {
            let mut prescale_replicas = 0;
            // sum replicas of all stacks currently getting traffic
            for sibling in stacks.values() {
                let sibling_actual = traffic
                    .get(sibling.name())
                    .map(|t| t.actual_weight)
                    .unwrap_or(0.0);
                if sibling_actual <= WEIGHT_EPSILON {
                    continue;
                }
                if let Some(current) = sibling
                    .resources
                    .hpa
                    .as_ref()
                    .and_then(|h| h.status.as_ref())
                    .and_then(|s| s.current_replicas)
                {
                    prescale_replicas += current;
                    continue;
                }
                if let Some(sibling_deployment) = &sibling.resources.deployment {
                    prescale_replicas += sibling_deployment
                        .spec
                        .as_ref()
                        .and_then(|s| s.replicas)
                        .unwrap_or(0);
                }
            }

            if prescale_replicas > 0 {
                annotations.insert(
                    PRESCALE_ANNOTATION_KEY.to_string(),
                    prescale_replicas.to_string(),
                );
                annotations.remove(PRESCALE_REMOVED_AT_ANNOTATION_KEY);
                if stack.spec.horizontal_pod_autoscaler.is_none() {
                    deployment
                        .spec
                        .get_or_insert_with(Default::default)
                        .replicas = Some(prescale_replicas);
                }
            }
        }

        Ok(())
    }

    /// Raises the HPA floor to the prescale target while prescaling is in
    /// flight, and keeps it raised for the configured cool-down after the
    /// target is removed so the autoscaler doesn't collapse the stack the
    /// moment traffic arrives.
    pub fn reconcile_hpa(
        &self,
        stack: &Stack,
        hpa: &mut HorizontalPodAutoscaler,
        deployment: &mut Deployment,
        existing_hpa: Option<&HorizontalPodAutoscaler>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(autoscaler) = &stack.spec.horizontal_pod_autoscaler else {
            return Ok(());
        };
        let Some(spec) = hpa.spec.as_mut() else {
            return Ok(());
        };

        spec.min_replicas = autoscaler.min_replicas;
        spec.max_replicas = autoscaler.max_replicas;

        if let Some(prescale) = deployment_prescale(deployment) {
            spec.min_replicas = Some(prescale.min(autoscaler.max_replicas));
            return Ok(());
        }

        let annotations = deployment
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new);
        let Some(raw) = annotations.get(PRESCALE_REMOVED_AT_ANNOTATION_KEY).cloned() else {
            return Ok(());
        };

        match DateTime::parse_from_rfc3339(&raw) {
            Ok(removed_at) => {
                let elapsed = now.signed_duration_since(removed_at.with_timezone(&Utc));
                let timeout = chrono::Duration::from_std(self.reset_hpa_min_replicas_timeout)
                    .unwrap_or(chrono::Duration::MAX);
                if elapsed < timeout {
                    // keep the floor where prescaling pinned it
                    if let Some(pinned) = existing_hpa
                        .and_then(|h| h.spec.as_ref())
                        .and_then(|s| s.min_replicas)
                    {
                        spec.min_replicas = Some(pinned.min(autoscaler.max_replicas));
                    }
                } else {
                    annotations.remove(PRESCALE_REMOVED_AT_ANNOTATION_KEY);
                }
            }
            Err(err) => {
                warn!(value = raw.as_str(), error = %err,
                    "Ignoring malformed prescale-removed-at annotation");
                annotations.remove(PRESCALE_REMOVED_AT_ANNOTATION_KEY);
            }
        }

        Ok(())
    }

    /// Calculates the traffic distribution for the routing objects.
    ///
    /// A stack carrying the prescale annotation only becomes an available
    /// backend once it has at least that many ready replicas. A stack already
    /// getting traffic keeps its share even while below the target. When no
    /// backend qualifies, the current weights are reported, and failing
    /// those, the desired weights.
    pub fn reconcile_traffic(
        &self,
        stacks: &BTreeMap<String, StackContainer>,
        traffic: &BTreeMap<String, TrafficStatus>,
    ) -> (BTreeMap<String, f64>, BTreeMap<String, f64>) {
        let mut desired = BTreeMap::new();
        let mut current = BTreeMap::new();
        let mut available = BTreeMap::new();

        for sc in stacks.values() {
            let name = sc.name().to_string();
            let status = traffic.get(&name).copied().unwrap_or_default();
            desired.insert(name.clone(), status.desired_weight);
            current.insert(name.clone(), status.actual_weight);

            let deployment = sc.resources.deployment.as_ref();

            if status.actual_weight > WEIGHT_EPSILON {
                let below_target = deployment
                    .and_then(|d| deployment_prescale(d).map(|n| ready_replicas(d) < n))
                    .unwrap_or(false);
                if below_target {
                    // don't pull traffic from a partially-unhealthy serving backend
                    available.insert(name, status.actual_weight);
                } else {
                    available.insert(name, status.desired_weight);
                }
                continue;
            }

            if let Some(deployment) = deployment {
                if let Some(prescale) = deployment_prescale(deployment) {
                    let desired_replicas = deployment
                        .spec
                        .as_ref()
                        .and_then(|s| s.replicas)
                        .unwrap_or(1);
                    if desired_replicas >= prescale && ready_replicas(deployment) >= prescale {
                        available.insert(name, status.desired_weight);
                    }
                }
            }
        }

        if !all_zero(&current) {
            normalize_weights(&mut current);
        }
        if !all_zero(&desired) {
            normalize_weights(&mut desired);
        }

        if available.is_empty() {
            available = current.clone();
            if all_zero(&available) {
                available = desired.clone();
            }
        }
        normalize_weights(&mut available);

        (available, desired)
    }
}
