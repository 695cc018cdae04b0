//! Custom Resource Definitions for the StackSet operator
//!
//! - StackSet: declares a family of versioned stacks and their traffic split
//! - Stack: one immutable versioned revision, owned by a StackSet
//! - RouteGroup: external routing CRD written on behalf of StackSets

mod routegroup;
mod stack;
mod stackset;

pub use routegroup::{
    RouteGroup, RouteGroupBackend, RouteGroupBackendReference, RouteGroupRouteSpec, RouteGroupSpec,
};
pub use stack::{AutoscalerSpec, Stack, StackServiceSpec, StackSpec, StackStatus};
pub use stackset::{
    DesiredTraffic, StackLifecycle, StackSet, StackSetCondition, StackSetIngressSpec,
    StackSetRouteGroupSpec, StackSetSpec, StackSetStatus, StackSpecTemplate, StackTemplate,
};
