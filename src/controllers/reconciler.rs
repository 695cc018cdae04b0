//! Traffic reconciler variants
//!
//! Every StackSet container carries one reconciler variant, chosen by
//! annotation. The simple variant reports the desired weights unchanged; the
//! prescaling variant ramps replicas up before admitting traffic.

use crate::controllers::container::{StackContainer, TrafficStatus};
use crate::controllers::prescale::PrescalingTrafficReconciler;
use crate::crd::Stack;
use crate::error::Result;
use crate::traffic::normalize_weights;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use std::collections::BTreeMap;

/// Traffic policy applied to one StackSet family
#[derive(Debug, Clone, PartialEq)]
pub enum TrafficReconciler {
    Simple(SimpleTrafficReconciler),
    Prescaling(PrescalingTrafficReconciler),
}

impl TrafficReconciler {
    /// Adjusts the target deployment before it is applied.
    pub fn reconcile_deployment(
        &self,
        stacks: &BTreeMap<String, StackContainer>,
        stack: &Stack,
        traffic: &BTreeMap<String, TrafficStatus>,
        deployment: &mut Deployment,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match self {
            TrafficReconciler::Simple(_) => Ok(()),
            TrafficReconciler::Prescaling(r) => {
                r.reconcile_deployment(stacks, stack, traffic, deployment, now)
            }
        }
    }

    /// Adjusts the target HPA before it is applied. The prescaling variant
    /// may also strip expired cool-down state from the deployment.
    pub fn reconcile_hpa(
        &self,
        stack: &Stack,
        hpa: &mut HorizontalPodAutoscaler,
        deployment: &mut Deployment,
        existing_hpa: Option<&HorizontalPodAutoscaler>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match self {
            TrafficReconciler::Simple(_) => Ok(()),
            TrafficReconciler::Prescaling(r) => {
                r.reconcile_hpa(stack, hpa, deployment, existing_hpa, now)
            }
        }
    }

    /// Computes the `(available, desired)` weight vectors for the family.
    /// Both vectors are normalized to a sum of 100 unless empty.
    pub fn reconcile_traffic(
        &self,
        stacks: &BTreeMap<String, StackContainer>,
        traffic: &BTreeMap<String, TrafficStatus>,
    ) -> (BTreeMap<String, f64>, BTreeMap<String, f64>) {
        match self {
            TrafficReconciler::Simple(r) => r.reconcile_traffic(stacks, traffic),
            TrafficReconciler::Prescaling(r) => r.reconcile_traffic(stacks, traffic),
        }
    }
}

/// Reports the desired weights as both desired and available.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimpleTrafficReconciler;

impl SimpleTrafficReconciler {
    pub fn reconcile_traffic(
        &self,
        stacks: &BTreeMap<String, StackContainer>,
        traffic: &BTreeMap<String, TrafficStatus>,
    ) -> (BTreeMap<String, f64>, BTreeMap<String, f64>) {
        let mut desired = BTreeMap::new();
        for sc in stacks.values() {
            let name = sc.name().to_string();
            let weight = traffic.get(&name).map(|t| t.desired_weight).unwrap_or(0.0);
            desired.insert(name, weight);
        }
        normalize_weights(&mut desired);
        (desired.clone(), desired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::StackSpec;
    use crate::traffic::WEIGHT_EPSILON;
    use k8s_openapi::api::core::v1::PodTemplateSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn stack_container(name: &str) -> StackContainer {
        StackContainer::new(Stack {
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
        })
    }

    fn family(names: &[&str]) -> BTreeMap<String, StackContainer> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| (format!("uid-{}", i), stack_container(name)))
            .collect()
    }

    #[test]
    fn test_simple_available_equals_desired() {
        let stacks = family(&["foo-v1", "foo-v2"]);
        let traffic = BTreeMap::from([
            (
                "foo-v1".to_string(),
                TrafficStatus {
                    desired_weight: 30.0,
                    actual_weight: 100.0,
                },
            ),
            (
                "foo-v2".to_string(),
                TrafficStatus {
                    desired_weight: 70.0,
                    actual_weight: 0.0,
                },
            ),
        ]);

        let reconciler = SimpleTrafficReconciler;
        let (available, desired) = reconciler.reconcile_traffic(&stacks, &traffic);
        assert_eq!(available, desired);
        assert!((desired["foo-v1"] - 30.0).abs() < WEIGHT_EPSILON);
        assert!((desired["foo-v2"] - 70.0).abs() < WEIGHT_EPSILON);
    }

    #[test]
    fn test_simple_normalizes_to_100() {
        let stacks = family(&["foo-v1", "foo-v2"]);
        let traffic = BTreeMap::from([
            (
                "foo-v1".to_string(),
                TrafficStatus {
                    desired_weight: 1.0,
                    actual_weight: 0.0,
                },
            ),
            (
                "foo-v2".to_string(),
                TrafficStatus {
                    desired_weight: 3.0,
                    actual_weight: 0.0,
                },
            ),
        ]);

        let (available, _) = SimpleTrafficReconciler.reconcile_traffic(&stacks, &traffic);
        assert!((available["foo-v1"] - 25.0).abs() < WEIGHT_EPSILON);
        assert!((available["foo-v2"] - 75.0).abs() < WEIGHT_EPSILON);
    }

    #[test]
    fn test_simple_all_zero_distributes_equally() {
        let stacks = family(&["foo-v1", "foo-v2"]);
        let traffic = BTreeMap::new();

        let (available, desired) = SimpleTrafficReconciler.reconcile_traffic(&stacks, &traffic);
        assert!((available["foo-v1"] - 50.0).abs() < WEIGHT_EPSILON);
        assert!((desired["foo-v2"] - 50.0).abs() < WEIGHT_EPSILON);
    }
}
