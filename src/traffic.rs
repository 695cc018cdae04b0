//! Traffic weight algebra and the operator-facing traffic switcher
//!
//! The weight functions here are shared between the background reconcilers
//! and the `traffic` CLI subcommand. Both must produce byte-identical weight
//! maps for identical inputs because downstream routers compare annotation
//! values by equality.

use crate::controllers::STACKSET_HERITAGE_LABEL_KEY;
use crate::crd::Stack;
use crate::error::{OperatorError, Result};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::Client;
use std::collections::BTreeMap;
use tracing::warn;

/// Annotation carrying the desired per-stack weights, `{stackName: weight}` JSON
pub const STACK_TRAFFIC_WEIGHTS_ANNOTATION_KEY: &str = "zalando.org/stack-traffic-weights";
/// Default annotation carrying the weights the router currently honours
pub const DEFAULT_BACKEND_WEIGHTS_ANNOTATION_KEY: &str = "zalando.org/backend-weights";

/// Tolerance for floating-point weight comparisons
pub const WEIGHT_EPSILON: f64 = 1e-9;

/// Returns true if every weight in the map is zero or below.
pub fn all_zero(weights: &BTreeMap<String, f64>) -> bool {
    weights.values().all(|w| *w <= 0.0)
}

/// Normalizes the weights to a sum of 100.
///
/// An empty map stays empty. If all weights are zero the total weight of 100
/// is distributed equally between all entries.
pub fn normalize_weights(weights: &mut BTreeMap<String, f64>) {
    if weights.is_empty() {
        return;
    }

    // if all weights are zero distribute them equally to all backends
    if all_zero(weights) {
        let eq_weight = 100.0 / weights.len() as f64;
        for weight in weights.values_mut() {
            *weight = eq_weight;
        }
        return;
    }

    let sum: f64 = weights.values().sum();
    for weight in weights.values_mut() {
        *weight = *weight / sum * 100.0;
    }
}

/// Sets a new weight for the named stack and rescales the other entries
/// proportionally so the sum stays at 100. Assumes the input sums to 100.
pub fn set_weight(weights: &mut BTreeMap<String, f64>, stack_name: &str, weight: f64) -> Result<()> {
    let current = match weights.get(stack_name) {
        Some(w) => *w,
        None => {
            return Err(OperatorError::NotFound(format!(
                "stack '{}' has no traffic entry",
                stack_name
            )))
        }
    };

    let change = if current < 100.0 - WEIGHT_EPSILON {
        (100.0 - weight) / (100.0 - current)
    } else if weight < 100.0 - WEIGHT_EPSILON {
        return Err(OperatorError::SoleBackend(format!(
            "'{}' is the only stack getting traffic, can't reduce it to {:.1}%",
            stack_name, weight
        )));
    } else {
        0.0
    };

    for (name, w) in weights.iter_mut() {
        if name == stack_name {
            *w = weight;
        } else {
            *w *= change;
        }
    }

    Ok(())
}

/// Parses a weight-map annotation value. Malformed JSON is treated as an
/// absent annotation.
pub fn parse_weight_annotation(
    annotations: &BTreeMap<String, String>,
    key: &str,
) -> Option<BTreeMap<String, f64>> {
    let raw = annotations.get(key)?;
    match serde_json::from_str(raw) {
        Ok(weights) => Some(weights),
        Err(err) => {
            warn!(annotation = key, error = %err, "Ignoring malformed weight annotation");
            None
        }
    }
}

/// Per-stack traffic weights as seen by the operator tool
#[derive(Debug, Clone, PartialEq)]
pub struct StackTrafficWeight {
    /// Stack name
    pub name: String,
    /// Desired weight
    pub weight: f64,
    /// Weight the router currently honours
    pub actual_weight: f64,
}

/// Switches traffic between the stacks of a stackset by patching the desired
/// weights annotation on the top-level Ingress.
pub struct Switcher {
    client: Client,
    backend_weights_annotation_key: String,
}

impl Switcher {
    /// Create a new traffic switcher
    pub fn new(client: Client, backend_weights_annotation_key: impl Into<String>) -> Self {
        Self {
            client,
            backend_weights_annotation_key: backend_weights_annotation_key.into(),
        }
    }

    /// Returns the stacks of the stackset with their normalized traffic weights.
    pub async fn traffic_weights(
        &self,
        stackset: &str,
        namespace: &str,
    ) -> Result<Vec<StackTrafficWeight>> {
        let mut stacks = self.get_stacks(stackset, namespace).await?;
        let mut weights: BTreeMap<String, f64> = stacks
            .iter()
            .map(|s| (s.name.clone(), s.weight))
            .collect();
        normalize_weights(&mut weights);
        for stack in &mut stacks {
            stack.weight = weights.get(&stack.name).copied().unwrap_or(0.0);
        }
        Ok(stacks)
    }

    /// Changes the traffic weight for one stack, rescaling its siblings, and
    /// patches the desired weights annotation when anything changed.
    pub async fn switch(
        &self,
        stackset: &str,
        stack: &str,
        namespace: &str,
        weight: f64,
    ) -> Result<Vec<StackTrafficWeight>> {
        let mut stacks = self.get_stacks(stackset, namespace).await?;

        let mut weights: BTreeMap<String, f64> = stacks
            .iter()
            .map(|s| (s.name.clone(), s.weight))
            .collect();
        normalize_weights(&mut weights);
        let before = weights.clone();

        set_weight(&mut weights, stack, weight)?;

        let change_needed = weights
            .iter()
            .any(|(name, w)| (w - before.get(name).copied().unwrap_or(0.0)).abs() > WEIGHT_EPSILON);

        if change_needed {
            let payload = serde_json::to_string(&weights)?;
            let patch = serde_json::json!({
                "metadata": {
                    "annotations": {
                        STACK_TRAFFIC_WEIGHTS_ANNOTATION_KEY: payload,
                    }
                }
            });
            let ingresses: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
            ingresses
                .patch(stackset, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map_err(|e| OperatorError::KubeApi(e.to_string()))?;
        }

        for stack in &mut stacks {
            stack.weight = weights.get(&stack.name).copied().unwrap_or(0.0);
        }
        Ok(stacks)
    }

    /// Lists the stacks of the stackset with the weights read from the
    /// top-level Ingress annotations.
    async fn get_stacks(&self, stackset: &str, namespace: &str) -> Result<Vec<StackTrafficWeight>> {
        let stacks_api: Api<Stack> = Api::namespaced(self.client.clone(), namespace);
        let selector = format!("{}={}", STACKSET_HERITAGE_LABEL_KEY, stackset);
        let stacks = stacks_api
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|e| {
                OperatorError::KubeApi(format!(
                    "failed to list stacks of stackset {}/{}: {}",
                    namespace, stackset, e
                ))
            })?;

        if stacks.items.is_empty() {
            return Ok(Vec::new());
        }

        let ingresses: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        let ingress = ingresses.get(stackset).await.map_err(|e| {
            OperatorError::KubeApi(format!(
                "failed to get ingress for stackset {}/{}: {}",
                namespace, stackset, e
            ))
        })?;

        let empty = BTreeMap::new();
        let annotations = ingress.metadata.annotations.as_ref().unwrap_or(&empty);
        let desired = parse_weight_annotation(annotations, STACK_TRAFFIC_WEIGHTS_ANNOTATION_KEY)
            .unwrap_or_default();
        let actual = parse_weight_annotation(annotations, &self.backend_weights_annotation_key)
            .unwrap_or_default();

        let mut weights: Vec<StackTrafficWeight> = stacks
            .items
            .iter()
            .filter_map(|stack| stack.metadata.name.clone())
            .map(|name| StackTrafficWeight {
                weight: desired.get(&name).copied().unwrap_or(0.0),
                actual_weight: actual.get(&name).copied().unwrap_or(0.0),
                name,
            })
            .collect();
        weights.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(weights)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weights(entries: &[(&str, f64)]) -> BTreeMap<String, f64> {
        entries
            .iter()
            .map(|(name, w)| (name.to_string(), *w))
            .collect()
    }

    #[test]
    fn test_all_zero() {
        assert!(all_zero(&weights(&[])));
        assert!(all_zero(&weights(&[("a", 0.0), ("b", 0.0)])));
        assert!(all_zero(&weights(&[("a", -1.0)])));
        assert!(!all_zero(&weights(&[("a", 0.0), ("b", 0.1)])));
    }

    #[test]
    fn test_normalize_empty() {
        let mut w = weights(&[]);
        normalize_weights(&mut w);
        assert!(w.is_empty());
    }

    #[test]
    fn test_normalize_all_zero_distributes_equally() {
        let mut w = weights(&[("a", 0.0), ("b", 0.0), ("c", 0.0), ("d", 0.0)]);
        normalize_weights(&mut w);
        for weight in w.values() {
            assert!((weight - 25.0).abs() < WEIGHT_EPSILON);
        }
        let sum: f64 = w.values().sum();
        assert!((sum - 100.0).abs() < WEIGHT_EPSILON);
    }

    #[test]
    fn test_normalize_proportional() {
        let mut w = weights(&[("a", 1.0), ("b", 3.0)]);
        normalize_weights(&mut w);
        assert!((w["a"] - 25.0).abs() < WEIGHT_EPSILON);
        assert!((w["b"] - 75.0).abs() < WEIGHT_EPSILON);
    }

    #[test]
    fn test_normalize_sums_to_100() {
        let mut w = weights(&[("a", 13.7), ("b", 29.1), ("c", 0.2), ("d", 57.0)]);
        normalize_weights(&mut w);
        let sum: f64 = w.values().sum();
        assert!((sum - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_set_weight_rescales_siblings() {
        let mut w = weights(&[("a", 50.0), ("b", 30.0), ("c", 20.0)]);
        set_weight(&mut w, "a", 80.0).unwrap();
        assert!((w["a"] - 80.0).abs() < WEIGHT_EPSILON);
        // (100 - 80) / (100 - 50) = 0.4
        assert!((w["b"] - 12.0).abs() < WEIGHT_EPSILON);
        assert!((w["c"] - 8.0).abs() < WEIGHT_EPSILON);
        let sum: f64 = w.values().sum();
        assert!((sum - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_set_weight_to_zero() {
        let mut w = weights(&[("a", 40.0), ("b", 60.0)]);
        set_weight(&mut w, "a", 0.0).unwrap();
        assert!((w["a"]).abs() < WEIGHT_EPSILON);
        assert!((w["b"] - 100.0).abs() < WEIGHT_EPSILON);
    }

    #[test]
    fn test_set_weight_sole_backend_rejected() {
        let mut w = weights(&[("a", 100.0), ("b", 0.0)]);
        let err = set_weight(&mut w, "a", 50.0).unwrap_err();
        assert!(matches!(err, OperatorError::SoleBackend(_)));
    }

    #[test]
    fn test_set_weight_sole_backend_full_weight_allowed() {
        let mut w = weights(&[("a", 100.0), ("b", 0.0)]);
        set_weight(&mut w, "a", 100.0).unwrap();
        assert!((w["a"] - 100.0).abs() < WEIGHT_EPSILON);
        assert!((w["b"]).abs() < WEIGHT_EPSILON);
    }

    #[test]
    fn test_set_weight_unknown_stack() {
        let mut w = weights(&[("a", 100.0)]);
        let err = set_weight(&mut w, "nope", 50.0).unwrap_err();
        assert!(matches!(err, OperatorError::NotFound(_)));
    }

    #[test]
    fn test_set_weight_never_negative() {
        let mut w = weights(&[("a", 10.0), ("b", 90.0), ("c", 0.0)]);
        set_weight(&mut w, "b", 100.0).unwrap();
        for weight in w.values() {
            assert!(*weight >= 0.0);
        }
        let sum: f64 = w.values().sum();
        assert!((sum - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_weight_maps_serialize_deterministically() {
        // Switcher and reconciler must emit byte-identical payloads
        let mut a = weights(&[("foo-v2", 70.0), ("foo-v1", 30.0)]);
        let mut b = weights(&[("foo-v1", 30.0), ("foo-v2", 70.0)]);
        normalize_weights(&mut a);
        normalize_weights(&mut b);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn test_parse_weight_annotation() {
        let mut annotations = BTreeMap::new();
        annotations.insert(
            STACK_TRAFFIC_WEIGHTS_ANNOTATION_KEY.to_string(),
            r#"{"foo-v1": 30.0, "foo-v2": 70.0}"#.to_string(),
        );
        let parsed =
            parse_weight_annotation(&annotations, STACK_TRAFFIC_WEIGHTS_ANNOTATION_KEY).unwrap();
        assert_eq!(parsed["foo-v1"], 30.0);
        assert_eq!(parsed["foo-v2"], 70.0);
    }

    #[test]
    fn test_parse_weight_annotation_malformed_is_absent() {
        let mut annotations = BTreeMap::new();
        annotations.insert(
            STACK_TRAFFIC_WEIGHTS_ANNOTATION_KEY.to_string(),
            "not-json".to_string(),
        );
        assert!(
            parse_weight_annotation(&annotations, STACK_TRAFFIC_WEIGHTS_ANNOTATION_KEY).is_none()
        );
        assert!(parse_weight_annotation(&annotations, "missing-key").is_none());
    }
}
