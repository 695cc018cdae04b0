//! Stack Custom Resource Definition
//!
//! A Stack is an immutable, versioned revision of a StackSet. It owns a
//! Deployment, a Service, and optionally a HorizontalPodAutoscaler; those
//! children are garbage-collected through owner references when the Stack
//! is deleted.

use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::api::core::v1::ServicePort;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Stack is the Schema for the stacks API
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "zalando.org",
    version = "v1",
    kind = "Stack",
    namespaced,
    derive = "PartialEq",
    status = "StackStatus",
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct StackSpec {
    /// Number of replicas when no autoscaler is configured
    #[serde(default)]
    pub replicas: Option<i32>,

    /// Pod template for the Deployment backing this stack
    pub pod_template: PodTemplateSpec,

    /// Horizontal autoscaler configuration; when set, it owns the replica count
    #[serde(default)]
    pub horizontal_pod_autoscaler: Option<AutoscalerSpec>,

    /// Service configuration; container ports are used when absent
    #[serde(default)]
    pub service: Option<StackServiceSpec>,
}

/// Autoscaler configuration for a stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalerSpec {
    /// Minimum number of replicas
    #[serde(default)]
    pub min_replicas: Option<i32>,

    /// Maximum number of replicas
    pub max_replicas: i32,

    /// Target CPU utilization percentage
    #[serde(default = "default_cpu_target")]
    pub target_cpu_utilization_percentage: i32,
}

/// Service configuration for a stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct StackServiceSpec {
    /// Ports exposed by the stack service
    #[serde(default)]
    pub ports: Vec<ServicePort>,
}

/// Status of the Stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct StackStatus {
    /// Observed replicas of the backing Deployment
    #[serde(default)]
    pub replicas: i32,
    /// Ready replicas of the backing Deployment
    #[serde(default)]
    pub ready_replicas: i32,
}

fn default_cpu_target() -> i32 {
    80
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_spec_parsing() {
        let json = r#"{
            "podTemplate": {
                "spec": {
                    "containers": [{"name": "app", "image": "nginx"}]
                }
            },
            "replicas": 3
        }"#;
        let spec: StackSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.replicas, Some(3));
        assert!(spec.horizontal_pod_autoscaler.is_none());
    }

    #[test]
    fn test_autoscaler_spec_defaults() {
        let spec: AutoscalerSpec = serde_json::from_str(r#"{"maxReplicas": 10}"#).unwrap();
        assert_eq!(spec.min_replicas, None);
        assert_eq!(spec.max_replicas, 10);
        assert_eq!(spec.target_cpu_utilization_percentage, 80);
    }

    #[test]
    fn test_stack_status_defaults() {
        let status: StackStatus = serde_json::from_str("{}").unwrap();
        assert_eq!(status.replicas, 0);
        assert_eq!(status.ready_replicas, 0);
    }
}
