//! RouteGroup custom resource model
//!
//! RouteGroups (`zalando.org/v1`) are consumed by an external router. The
//! operator writes them on behalf of StackSets but does not define or manage
//! the CRD itself.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// RouteGroup routes hostnames to weighted service backends
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "zalando.org",
    version = "v1",
    kind = "RouteGroup",
    namespaced,
    derive = "PartialEq",
    shortname = "rg"
)]
#[serde(rename_all = "camelCase")]
pub struct RouteGroupSpec {
    /// Hostnames served by this routegroup
    #[serde(default)]
    pub hosts: Vec<String>,

    /// Backends referenced by routes and default backends
    #[serde(default)]
    pub backends: Vec<RouteGroupBackend>,

    /// Weighted default backends applied to routes without explicit backends
    #[serde(default)]
    pub default_backends: Vec<RouteGroupBackendReference>,

    /// Routes of this routegroup
    #[serde(default)]
    pub routes: Vec<RouteGroupRouteSpec>,
}

/// A backend a routegroup can direct traffic to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouteGroupBackend {
    /// Backend name referenced from routes
    pub name: String,

    /// Backend type; the operator only writes "service" backends
    #[serde(default = "default_backend_type")]
    pub r#type: String,

    /// Target service name
    #[serde(default)]
    pub service_name: Option<String>,

    /// Target service port
    #[serde(default)]
    pub service_port: Option<i32>,
}

/// Weighted reference to a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouteGroupBackendReference {
    /// Name of the referenced backend
    pub backend_name: String,

    /// Relative weight of the backend
    #[serde(default)]
    pub weight: i64,
}

/// A single route of a routegroup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct RouteGroupRouteSpec {
    /// Path subtree matched by this route
    #[serde(default)]
    pub path_subtree: Option<String>,

    /// Exact path matched by this route
    #[serde(default)]
    pub path: Option<String>,
}

fn default_backend_type() -> String {
    "service".to_string()
}
