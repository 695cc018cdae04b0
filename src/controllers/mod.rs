//! Controllers for the StackSet operator
//!
//! The stackset controller drives one reconcile pass per StackSet: observed
//! resources are assembled into per-family containers, the current stack is
//! materialized, traffic weights are computed and written, child objects are
//! converged, and retired stacks are cleaned up.

mod children;
mod collector;
mod container;
mod lifecycle;
mod prescale;
mod reconciler;
mod stackset;

pub use children::{
    counterpart_allows_removal, stack_deployment, stack_hpa, stack_owner_reference, stack_service,
    stackset_ingress, stackset_owner_reference, stackset_routegroup,
    ROUTING_OBJECT_DELETION_GRACE_SECONDS,
};
pub use collector::{
    collect_resources, get_owner_uid, reconciler_for, ClusterState,
    DEFAULT_RESET_MIN_REPLICAS_DELAY,
};
pub use container::{StackContainer, StackResources, StackSetContainer, TrafficStatus};
pub use lifecycle::{
    cleanup_old_stacks, create_current_stack, current_stack_name, generate_stack,
    mark_pending_removal,
};
pub use prescale::{
    deployment_prescale, PrescalingTrafficReconciler, PRESCALE_ANNOTATION_KEY,
    PRESCALE_REMOVED_AT_ANNOTATION_KEY,
};
pub use reconciler::{SimpleTrafficReconciler, TrafficReconciler};
pub use stackset::{ControllerConfig, StackSetController};

use crate::error::OperatorError;
use kube::runtime::controller::Action;
use std::time::Duration;

/// Label connecting stacks (and their pods) to the owning stackset
pub const STACKSET_HERITAGE_LABEL_KEY: &str = "stackset";
/// Label carrying the stack version
pub const STACK_VERSION_LABEL_KEY: &str = "stack-version";

/// Annotation selecting which controller instance reconciles a StackSet
pub const CONTROLLER_ANNOTATION_KEY: &str = "stackset-controller.zalando.org/controller";
/// Annotation stamped on routing objects at every write; drives the
/// cross-object deletion grace window
pub const UPDATED_TIMESTAMP_ANNOTATION_KEY: &str =
    "stackset-controller.zalando.org/updated-timestamp";
/// Annotation on a Stack marking when it was last seen without traffic
pub const NO_TRAFFIC_SINCE_ANNOTATION_KEY: &str =
    "stackset-controller.zalando.org/no-traffic-since";
/// Annotation opting a StackSet into the prescaling traffic reconciler
pub const PRESCALE_STACKS_ANNOTATION_KEY: &str =
    "alpha.stackset-controller.zalando.org/prescale-stacks";
/// Annotation configuring the HPA floor reset delay, as a duration string
pub const RESET_HPA_MIN_REPLICAS_DELAY_ANNOTATION_KEY: &str =
    "alpha.stackset-controller.zalando.org/reset-hpa-min-replicas-delay";

/// Field manager used for server-side apply patches
pub const FIELD_MANAGER: &str = "stackset-operator";

/// Exponential backoff error policy for controller reconciliation failures.
/// Categorizes errors by severity to choose appropriate retry delays.
pub(crate) fn error_policy_backoff<K>(
    _object: std::sync::Arc<K>,
    error: &OperatorError,
    _ctx: std::sync::Arc<impl std::any::Any + Send + Sync>,
) -> Action {
    let delay_secs = match error {
        // Transient K8s API errors — retry quickly
        OperatorError::KubeApi(_) => 10,
        // Resource not yet available — moderate wait
        OperatorError::NotFound(_) => 15,
        // Reconciliation/state issues — longer wait
        OperatorError::Reconciliation(_) | OperatorError::SoleBackend(_) => 30,
        // Declaration errors unlikely to self-heal — back off further
        OperatorError::Configuration(_)
        | OperatorError::Serialization(_)
        | OperatorError::InvalidStackSet(_) => 60,
    };

    Action::requeue(Duration::from_secs(delay_secs))
}
