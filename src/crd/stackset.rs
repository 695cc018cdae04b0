//! StackSet Custom Resource Definition
//!
//! A StackSet declares a family of versioned stacks, the routing objects in
//! front of them, the desired traffic split, and the lifecycle policy for
//! retiring old stacks.

use crate::crd::stack::StackSpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// StackSet is the Schema for the stacksets API
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "zalando.org",
    version = "v1",
    kind = "StackSet",
    namespaced,
    derive = "PartialEq",
    status = "StackSetStatus",
    shortname = "ssets",
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".status.observedStackVersion"}"#,
    printcolumn = r#"{"name":"Stacks","type":"integer","jsonPath":".status.stacks"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyStacks"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct StackSetSpec {
    /// Template from which new stacks are materialized
    pub stack_template: StackTemplate,

    /// Ingress configuration for the family; no ingress is created when absent
    #[serde(default)]
    pub ingress: Option<StackSetIngressSpec>,

    /// RouteGroup configuration for the family; no routegroup is created when absent
    #[serde(default)]
    pub route_group: Option<StackSetRouteGroupSpec>,

    /// Desired traffic split across stacks of the family
    #[serde(default)]
    pub traffic: Option<Vec<DesiredTraffic>>,

    /// Lifecycle policy for retiring old stacks
    #[serde(default)]
    pub stack_lifecycle: StackLifecycle,
}

/// Template for new stacks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StackTemplate {
    pub spec: StackSpecTemplate,
}

/// Versioned stack spec inside the template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StackSpecTemplate {
    /// Version string; a change triggers creation of a new stack
    pub version: String,

    #[serde(flatten)]
    pub stack_spec: StackSpec,
}

/// Desired traffic weight for a single stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DesiredTraffic {
    /// Name of the stack, `{stacksetName}-{version}`
    pub stack_name: String,
    /// Weight share; the family vector is normalized to a sum of 100
    pub weight: f64,
}

/// Lifecycle policy for stacks of the family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StackLifecycle {
    /// Seconds a stack must be without traffic before it may be scaled down
    #[serde(default = "default_scaledown_ttl_seconds")]
    pub scaledown_ttl_seconds: u64,

    /// Maximum number of stacks to retain
    #[serde(default = "default_stack_limit")]
    pub limit: i32,
}

impl Default for StackLifecycle {
    fn default() -> Self {
        Self {
            scaledown_ttl_seconds: default_scaledown_ttl_seconds(),
            limit: default_stack_limit(),
        }
    }
}

/// Ingress configuration carried by the StackSet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StackSetIngressSpec {
    /// Hostnames routed to the family
    pub hosts: Vec<String>,

    /// Service port the ingress backends point at
    #[serde(default = "default_backend_port")]
    pub backend_port: i32,

    /// HTTP path; defaults to the root
    #[serde(default)]
    pub path: Option<String>,

    /// Extra annotations propagated onto the ingress
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// RouteGroup configuration carried by the StackSet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StackSetRouteGroupSpec {
    /// Hostnames routed to the family
    pub hosts: Vec<String>,

    /// Service port the routegroup backends point at
    #[serde(default = "default_backend_port")]
    pub backend_port: i32,

    /// Extra annotations propagated onto the routegroup
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// Status of the StackSet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct StackSetStatus {
    /// Number of stacks belonging to the family
    #[serde(default)]
    pub stacks: i32,
    /// Number of stacks whose deployment is fully ready
    #[serde(default)]
    pub ready_stacks: i32,
    /// Stack version most recently materialized from the template
    #[serde(default)]
    pub observed_stack_version: String,
    /// Conditions representing StackSet state
    #[serde(default)]
    pub conditions: Vec<StackSetCondition>,
}

/// Condition of the StackSet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StackSetCondition {
    /// Type of condition
    pub r#type: String,
    /// Status of the condition (True, False, Unknown)
    pub status: String,
    /// Last time the condition transitioned
    #[serde(default)]
    pub last_transition_time: Option<String>,
    /// Reason for the condition
    #[serde(default)]
    pub reason: Option<String>,
    /// Human-readable message
    #[serde(default)]
    pub message: Option<String>,
}

// Default value functions
fn default_scaledown_ttl_seconds() -> u64 {
    300
}

fn default_stack_limit() -> i32 {
    10
}

fn default_backend_port() -> i32 {
    80
}
