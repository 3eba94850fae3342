//! Reconciliation engine for Synapse resources.
//!
//! Each pass fetches the observed state fresh from the resource store,
//! classifies it with a pure transition function, and performs at most one
//! corrective mutation before requesting re-invocation. Creation order is
//! credential Secret, then configuration ConfigMap, then Deployment; a
//! fingerprint annotation on the ConfigMap decides when homeserver.yaml
//! has to be re-rendered.
//!
//! The one-mutation-then-requeue policy is what makes the loop crash-safe:
//! nothing carries over between passes except what is persisted in the
//! store, so an interrupted pass is indistinguishable from a completed one
//! followed by a retry.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube_runtime::controller::Action;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::builders::{self, HOMESERVER_YAML, INPUT_ID_ANNOTATION};
use crate::store::{KubeStore, ResourceId, ResourceStore, StoreError};
use crate::Synapse;

#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Resource store access failed. Transient: the pass is retried by the
    /// scheduler after backoff.
    #[error("resource store: {0}")]
    Store(#[from] StoreError),
    /// homeserver.yaml generation failed. Retrying without a spec change
    /// cannot succeed.
    #[error("rendering homeserver.yaml: {0}")]
    Render(#[from] askama::Error),
    /// The Synapse spec is unusable. Surfaced to the operator instead of
    /// being retried forever.
    #[error("invalid Synapse spec: {0}")]
    InvalidSpec(String),
}

impl ReconcileError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReconcileError::Store(_))
    }
}

/// Everything one reconcile pass knows about a Synapse identity, fetched
/// from the store at the start of the pass. Absence is state here, not an
/// error.
#[derive(Debug, Default)]
pub struct ObservedState {
    pub synapse: Option<Synapse>,
    pub secret: Option<Secret>,
    pub config_map: Option<ConfigMap>,
    pub deployment: Option<Deployment>,
}

/// The single corrective action a reconcile pass will take, derived purely
/// from [`ObservedState`]. Variants carry the observed resources the
/// executor needs, so classification and execution cannot disagree about
/// what was seen.
#[derive(Debug)]
pub enum ReconcileStep {
    /// The Synapse resource no longer exists; dependents are cleaned up by
    /// the store's garbage collector.
    Gone,
    CreateCredentials {
        synapse: Synapse,
    },
    CreateConfig {
        synapse: Synapse,
        secret: Secret,
    },
    /// The ConfigMap's recorded input fingerprint no longer matches the
    /// fingerprint recomputed from the Synapse spec and Secret.
    RefreshConfig {
        synapse: Synapse,
        secret: Secret,
        config_map: ConfigMap,
    },
    CreateWorkload {
        synapse: Synapse,
        secret: Secret,
        config_map: ConfigMap,
    },
    Converged,
}

impl ReconcileStep {
    /// Whether executing this step writes to the store (and therefore ends
    /// the pass with a requeue).
    pub fn mutates(&self) -> bool {
        !matches!(self, ReconcileStep::Gone | ReconcileStep::Converged)
    }
}

/// Pure transition function of the reconciliation state machine.
pub fn next_step(observed: ObservedState) -> Result<ReconcileStep, ReconcileError> {
    let Some(synapse) = observed.synapse else {
        return Ok(ReconcileStep::Gone);
    };
    if synapse.spec.server_name.is_empty() {
        return Err(ReconcileError::InvalidSpec(
            "spec.serverName must not be empty".to_string(),
        ));
    }

    let Some(secret) = observed.secret else {
        return Ok(ReconcileStep::CreateCredentials { synapse });
    };
    let Some(config_map) = observed.config_map else {
        return Ok(ReconcileStep::CreateConfig { synapse, secret });
    };

    let want = builders::homeserver_config(&synapse, &secret).fingerprint();
    let got = config_map
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(INPUT_ID_ANNOTATION));
    if got != Some(&want) {
        return Ok(ReconcileStep::RefreshConfig {
            synapse,
            secret,
            config_map,
        });
    }

    if observed.deployment.is_none() {
        return Ok(ReconcileStep::CreateWorkload {
            synapse,
            secret,
            config_map,
        });
    }

    Ok(ReconcileStep::Converged)
}

/// What the caller should do after a pass: re-invoke soon (a mutation was
/// made), or wait for the next change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Requeue,
    Done,
}

/// The reconciliation engine, generic over the resource store so it runs
/// identically against a cluster and against [`crate::store::MemoryStore`].
#[derive(Debug)]
pub struct Engine<S> {
    store: S,
}

impl<S: ResourceStore> Engine<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    async fn observe(&self, id: &ResourceId) -> Result<ObservedState, StoreError> {
        Ok(ObservedState {
            synapse: self.store.get_synapse(id).await?,
            secret: self.store.get_secret(id).await?,
            config_map: self.store.get_config_map(id).await?,
            deployment: self.store.get_deployment(id).await?,
        })
    }

    /// Runs one reconcile pass for the given identity: observe, classify,
    /// apply at most one mutation.
    ///
    /// Creation races surfacing as `AlreadyExists` are treated as success;
    /// the resource exists, and the next pass picks it up from the store.
    pub async fn reconcile(&self, id: &ResourceId) -> Result<Outcome, ReconcileError> {
        let observed = self.observe(id).await?;
        match next_step(observed)? {
            ReconcileStep::Gone => {
                debug!(%id, "get Synapse: not found, ignoring");
                Ok(Outcome::Done)
            }
            ReconcileStep::Converged => {
                debug!(%id, "converged, nothing to do");
                Ok(Outcome::Done)
            }
            ReconcileStep::CreateCredentials { synapse } => {
                info!(%id, "creating credential Secret");
                let secret = builders::synapse_secret(&synapse);
                self.create(self.store.create_secret(secret), id, "Secret")
                    .await
            }
            ReconcileStep::CreateConfig { synapse, secret } => {
                info!(%id, "creating ConfigMap");
                let config_map = builders::synapse_config_map(&synapse, &secret)?;
                self.create(self.store.create_config_map(config_map), id, "ConfigMap")
                    .await
            }
            ReconcileStep::RefreshConfig {
                synapse,
                secret,
                mut config_map,
            } => {
                let config = builders::homeserver_config(&synapse, &secret);
                let fingerprint = config.fingerprint();
                info!(%id, %fingerprint, "ConfigMap stale, re-rendering homeserver.yaml");
                let yaml = config.render()?;
                config_map
                    .data
                    .get_or_insert_with(Default::default)
                    .insert(HOMESERVER_YAML.to_string(), yaml);
                config_map
                    .metadata
                    .annotations
                    .get_or_insert_with(Default::default)
                    .insert(INPUT_ID_ANNOTATION.to_string(), fingerprint);
                self.store.update_config_map(config_map).await?;
                Ok(Outcome::Requeue)
            }
            ReconcileStep::CreateWorkload {
                synapse,
                secret,
                config_map,
            } => {
                info!(%id, "creating Deployment");
                let deployment = builders::synapse_deployment(&synapse, &secret, &config_map);
                self.create(self.store.create_deployment(deployment), id, "Deployment")
                    .await
            }
        }
    }

    async fn create(
        &self,
        result: impl std::future::Future<Output = Result<(), StoreError>>,
        id: &ResourceId,
        kind: &str,
    ) -> Result<Outcome, ReconcileError> {
        match result.await {
            Ok(()) => Ok(Outcome::Requeue),
            // Lost a creation race; the dependent exists, which is all the
            // pass wanted. Requeue and re-observe.
            Err(StoreError::AlreadyExists) => {
                info!(%id, kind, "already exists, treating as created");
                Ok(Outcome::Requeue)
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Context shared by all reconcile invocations of the kube controller.
#[derive(Debug)]
pub struct Context {
    pub engine: Engine<KubeStore>,
}

/// kube-runtime entry point: maps the engine outcome onto controller
/// actions. One mutation per pass means a short requeue until converged.
pub async fn reconcile(
    synapse: Arc<Synapse>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let id = ResourceId::from(&*synapse);
    match ctx.engine.reconcile(&id).await? {
        Outcome::Requeue => Ok(Action::requeue(Duration::from_secs(1))),
        Outcome::Done => Ok(Action::await_change()),
    }
}

/// Called by kube-runtime when [`reconcile`] fails. Transient store errors
/// are requeued with backoff; semantic errors wait for the resource to
/// change instead of retrying a pass that cannot succeed.
pub fn error_policy(synapse: Arc<Synapse>, error: &ReconcileError, _ctx: Arc<Context>) -> Action {
    let id = ResourceId::from(&*synapse);
    if error.is_retryable() {
        error!(%id, %error, "reconciliation failed, requeueing");
        Action::requeue(Duration::from_secs(60))
    } else {
        error!(%id, %error, "reconciliation failed, waiting for a spec change");
        Action::await_change()
    }
}
