//! The reconciler drives the children of one Application toward the state implied by its spec.
//! Each pass starts from a fresh read of the Application and of every child, so nothing is
//! carried over between passes. The three child kinds share one state machine, which only
//! differs in whether the kind is enabled.
mod compare;
mod ownership;

pub use self::compare::{compare_values, ComparisonPolicy, Diff, Diffs};
pub use self::ownership::{BindError, OwnershipBinder};

use crate::application::Application;
use crate::config::OperatorConfig;
use crate::k8s_types::APPLICATION;
use crate::manifest::{ChildKind, ManifestFactory, RenderError};
use crate::resource::{InvalidResourceError, K8sResource, ObjectId, ObjectIdRef};
use crate::runner::client;
use crate::runner::metrics::Metrics;
use crate::runner::store::ClusterStore;

use serde_json::Value;

use std::fmt::{self, Display};
use std::sync::Arc;

/// The observed state of one child kind, relative to what the Application wants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    Absent,
    PresentMatching,
    PresentDiverged,
    /// The child exists, but its kind is disabled for the Application
    PresentShouldNotExist,
    /// The child is already being deleted. Its deletion will trigger another pass.
    Terminating,
}

impl ChildState {
    /// Derives the state from the observed child and the desired manifest, which is `None` if
    /// the kind is disabled
    pub fn observe(
        observed: Option<&K8sResource>,
        desired: Option<&Value>,
        policy: &ComparisonPolicy,
    ) -> ChildState {
        let existing = match observed {
            None => return ChildState::Absent,
            Some(child) if child.is_deletion_timestamp_set() => return ChildState::Terminating,
            Some(child) => child,
        };
        let desired = match desired {
            Some(d) => d,
            None => return ChildState::PresentShouldNotExist,
        };

        let diffs = policy.diff(existing.as_ref(), desired);
        if diffs.is_empty() {
            ChildState::PresentMatching
        } else {
            log::info!(
                "{} {} has diverged from desired state: {}",
                existing.kind(),
                existing.get_object_id(),
                diffs
            );
            ChildState::PresentDiverged
        }
    }

    pub fn action(self, enabled: bool) -> ChildAction {
        match (self, enabled) {
            (ChildState::Absent, true) => ChildAction::Create,
            (ChildState::PresentDiverged, true) => ChildAction::Update,
            (ChildState::PresentShouldNotExist, false) => ChildAction::Delete,
            _ => ChildAction::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildAction {
    None,
    Create,
    Update,
    Delete,
}

impl ChildAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChildAction::None => "none",
            ChildAction::Create => "create",
            ChildAction::Update => "update",
            ChildAction::Delete => "delete",
        }
    }

    pub fn is_mutation(&self) -> bool {
        *self != ChildAction::None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChildDecision {
    pub kind: ChildKind,
    pub state: ChildState,
    pub action: ChildAction,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// The Application does not exist, so there's nothing to do
    ApplicationGone,
    /// The Application is being deleted, and its children are left to the garbage collector
    ApplicationDeleting,
    /// Every child kind was converged, with one decision per kind
    Converged(Vec<ChildDecision>),
}

impl ReconcileOutcome {
    /// The number of create, update and delete calls that were issued
    pub fn mutation_count(&self) -> usize {
        match self {
            ReconcileOutcome::Converged(decisions) => decisions
                .iter()
                .filter(|d| d.action.is_mutation())
                .count(),
            _ => 0,
        }
    }
}

#[derive(Debug)]
pub enum ReconcileError {
    Store(client::Error),
    Render(RenderError),
    InvalidResource(InvalidResourceError),
    Binding(BindError),
    /// The child exists, but is controlled by something other than the Application
    NotOwned {
        kind: ChildKind,
        id: ObjectId,
        owner_uid: String,
    },
}

impl ReconcileError {
    /// Returns true if retrying the pass may succeed without anything else changing. Every
    /// error is retried with backoff regardless, since the Application or the child may be
    /// changed by someone else.
    pub fn is_transient(&self) -> bool {
        match self {
            ReconcileError::Store(e) => e.is_transient(),
            ReconcileError::Binding(e) => e.is_transient(),
            ReconcileError::Render(_)
            | ReconcileError::InvalidResource(_)
            | ReconcileError::NotOwned { .. } => false,
        }
    }
}

impl Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReconcileError::Store(e) => write!(f, "Store error: {}", e),
            ReconcileError::Render(e) => write!(f, "Render error: {}", e),
            ReconcileError::InvalidResource(e) => Display::fmt(e, f),
            ReconcileError::Binding(e) => write!(f, "Ownership binding error: {}", e),
            ReconcileError::NotOwned {
                kind,
                id,
                owner_uid,
            } => write!(
                f,
                "{} {} is controlled by another owner with uid: '{}'",
                kind, id, owner_uid
            ),
        }
    }
}

impl std::error::Error for ReconcileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReconcileError::Store(e) => Some(e),
            ReconcileError::Render(e) => Some(e),
            ReconcileError::InvalidResource(e) => Some(e),
            ReconcileError::Binding(e) => Some(e),
            ReconcileError::NotOwned { .. } => None,
        }
    }
}

impl From<client::Error> for ReconcileError {
    fn from(err: client::Error) -> ReconcileError {
        ReconcileError::Store(err)
    }
}

impl From<RenderError> for ReconcileError {
    fn from(err: RenderError) -> ReconcileError {
        ReconcileError::Render(err)
    }
}

impl From<InvalidResourceError> for ReconcileError {
    fn from(err: InvalidResourceError) -> ReconcileError {
        ReconcileError::InvalidResource(err)
    }
}

impl From<BindError> for ReconcileError {
    fn from(err: BindError) -> ReconcileError {
        ReconcileError::Binding(err)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileSettings {
    pub binder: OwnershipBinder,
    pub comparison_policy: ComparisonPolicy,
}

impl ReconcileSettings {
    pub fn from_config(config: &OperatorConfig) -> ReconcileSettings {
        ReconcileSettings {
            binder: OwnershipBinder::from_config(config),
            comparison_policy: config.comparison_policy.clone(),
        }
    }
}

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn ClusterStore>,
    factory: Arc<dyn ManifestFactory>,
    settings: Arc<ReconcileSettings>,
    metrics: Option<Metrics>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        factory: Arc<dyn ManifestFactory>,
        settings: ReconcileSettings,
    ) -> Reconciler {
        Reconciler {
            store,
            factory,
            settings: Arc::new(settings),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Reconciler {
        self.metrics = Some(metrics);
        self
    }

    /// Runs one pass for the Application with the given id. The first error aborts the pass, and
    /// whatever was already done for earlier child kinds stays done.
    pub async fn reconcile(
        &self,
        id: ObjectIdRef<'_>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        if let Some(metrics) = self.metrics.as_ref() {
            metrics.reconcile_started(&id);
        }
        let result = self.reconcile_application(id).await;
        if let Err(err) = result.as_ref() {
            if let Some(metrics) = self.metrics.as_ref() {
                metrics.reconcile_error(&id);
            }
            if err.is_transient() {
                log::warn!("Reconcile of Application {} failed: {}", id, err);
            } else {
                log::error!("Reconcile of Application {} failed: {}", id, err);
            }
        }
        result
    }

    async fn reconcile_application(
        &self,
        id: ObjectIdRef<'_>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let app = match self.store.get(APPLICATION, id).await? {
            Some(json) => Application::from_resource(&K8sResource::from_value(json)?)?,
            None => {
                log::debug!("Application {} does not exist, nothing to do", id);
                return Ok(ReconcileOutcome::ApplicationGone);
            }
        };
        if app.deleting {
            log::debug!(
                "Application {} is being deleted, leaving its children to the garbage collector",
                id
            );
            return Ok(ReconcileOutcome::ApplicationDeleting);
        }

        log::debug!(
            "Starting reconcile of Application {} at generation: {}, resourceVersion: {}",
            id,
            app.generation,
            app.resource_version
        );
        let mut decisions = Vec::with_capacity(ChildKind::ALL.len());
        for kind in ChildKind::ALL.iter().copied() {
            decisions.push(self.reconcile_child(&app, kind).await?);
        }

        let outcome = ReconcileOutcome::Converged(decisions);
        log::info!(
            "Finished reconcile of Application {} with {} mutations",
            id,
            outcome.mutation_count()
        );
        Ok(outcome)
    }

    async fn reconcile_child(
        &self,
        app: &Application,
        kind: ChildKind,
    ) -> Result<ChildDecision, ReconcileError> {
        let enabled = kind.is_enabled(&app.spec);
        // rendering happens before any call for this kind, so a failure leaves nothing half done
        let desired = if enabled {
            let rendered = self.factory.render(kind, app)?;
            Some(self.settings.binder.bind(app, rendered)?)
        } else {
            None
        };

        let k8s_type = kind.k8s_type();
        let observed = match self.store.get(k8s_type, app.id_ref()).await? {
            Some(json) => Some(K8sResource::from_value(json)?),
            None => None,
        };
        let observed = match observed {
            Some(child) => match foreign_controller(app, &child) {
                Some(owner_uid) if enabled => {
                    return Err(ReconcileError::NotOwned {
                        kind,
                        id: child.get_object_id().to_owned(),
                        owner_uid,
                    });
                }
                Some(owner_uid) => {
                    // none of ours exists, so there's nothing to delete
                    log::debug!(
                        "Ignoring {} {} of disabled kind, which is controlled by uid: '{}'",
                        kind,
                        child.get_object_id(),
                        owner_uid
                    );
                    None
                }
                None => Some(child),
            },
            None => None,
        };

        let state = ChildState::observe(
            observed.as_ref(),
            desired.as_ref(),
            &self.settings.comparison_policy,
        );
        let action = state.action(enabled);
        log::debug!(
            "Application {} {} state: {:?}, action: {:?}",
            app.id,
            kind,
            state,
            action
        );

        match (action, desired) {
            (ChildAction::Create, Some(desired)) => {
                log::info!("Creating {} for Application {}", kind, app.id);
                self.store.create(k8s_type, &desired).await?;
            }
            (ChildAction::Update, Some(mut desired)) => {
                let resource_version = observed
                    .as_ref()
                    .map(|o| o.resource_version().to_owned())
                    .unwrap_or_default();
                let meta = desired.pointer_mut("/metadata").and_then(Value::as_object_mut);
                if let Some(meta) = meta {
                    meta.insert("resourceVersion".to_owned(), resource_version.into());
                }
                log::info!("Updating {} for Application {}", kind, app.id);
                self.store.replace(k8s_type, app.id_ref(), &desired).await?;
            }
            (ChildAction::Delete, _) => {
                log::info!(
                    "Deleting {} for Application {} since it is disabled",
                    kind,
                    app.id
                );
                self.store.delete(k8s_type, app.id_ref()).await?;
            }
            _ => {}
        }
        if action.is_mutation() {
            if let Some(metrics) = self.metrics.as_ref() {
                metrics.child_mutated(kind, action);
            }
        }
        Ok(ChildDecision {
            kind,
            state,
            action,
        })
    }
}

/// Returns the uid of the child's controller if that's anything other than the Application. A
/// child like that is never touched. A child without any controller gets adopted by the next
/// create or update.
fn foreign_controller(app: &Application, child: &K8sResource) -> Option<String> {
    child
        .controller_owner()
        .filter(|owner| owner.uid != app.uid)
        .map(|owner| owner.uid)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn child(extra_meta: Value, spec: Value) -> K8sResource {
        let mut meta = json!({
            "namespace": "default",
            "name": "shop",
            "uid": "child-uid",
            "resourceVersion": "5",
        });
        if let (Some(m), Some(extra)) = (meta.as_object_mut(), extra_meta.as_object()) {
            m.extend(extra.clone());
        }
        K8sResource::from_value(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": meta,
            "spec": spec,
        }))
        .unwrap()
    }

    #[test]
    fn absent_child_is_created_only_when_enabled() {
        let state = ChildState::observe(None, None, &ComparisonPolicy::default());
        assert_eq!(ChildState::Absent, state);
        assert_eq!(ChildAction::Create, state.action(true));
        assert_eq!(ChildAction::None, state.action(false));
    }

    #[test]
    fn matching_child_is_left_alone() {
        let existing = child(json!({}), json!({"type": "ClusterIP", "clusterIP": "10.0.0.1"}));
        let desired = json!({"spec": {"type": "ClusterIP"}});
        let policy = ComparisonPolicy::default();
        let state = ChildState::observe(Some(&existing), Some(&desired), &policy);
        assert_eq!(ChildState::PresentMatching, state);
        assert_eq!(ChildAction::None, state.action(true));
    }

    #[test]
    fn diverged_child_is_updated() {
        let existing = child(json!({}), json!({"type": "NodePort"}));
        let desired = json!({"spec": {"type": "ClusterIP"}});
        let policy = ComparisonPolicy::default();
        let state = ChildState::observe(Some(&existing), Some(&desired), &policy);
        assert_eq!(ChildState::PresentDiverged, state);
        assert_eq!(ChildAction::Update, state.action(true));
    }

    #[test]
    fn present_child_of_disabled_kind_is_deleted() {
        let existing = child(json!({}), json!({}));
        let state = ChildState::observe(Some(&existing), None, &ComparisonPolicy::default());
        assert_eq!(ChildState::PresentShouldNotExist, state);
        assert_eq!(ChildAction::Delete, state.action(false));
    }

    #[test]
    fn terminating_child_is_left_alone() {
        let existing = child(json!({"deletionTimestamp": "2020-01-01T00:00:00Z"}), json!({}));
        for desired in [None, Some(json!({"spec": {"type": "ClusterIP"}}))].iter() {
            let policy = ComparisonPolicy::default();
            let state = ChildState::observe(Some(&existing), desired.as_ref(), &policy);
            assert_eq!(ChildState::Terminating, state);
            assert_eq!(ChildAction::None, state.action(desired.is_some()));
        }
    }

    #[test]
    fn store_conflicts_are_transient_but_render_errors_are_not() {
        let conflict = ReconcileError::from(client::Error::http(http::StatusCode::CONFLICT));
        assert!(conflict.is_transient());
        let render = ReconcileError::from(RenderError::other(ChildKind::Ingress, "bad template"));
        assert!(!render.is_transient());
    }
}
