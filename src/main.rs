//! # Synapse Operator
//!
//! A Kubernetes operator that runs a Synapse Matrix homeserver from a
//! `Synapse` custom resource.
//!
//! For each `Synapse` the controller maintains three owned dependents, in
//! order:
//!
//! 1. **Credential Secret** - signing key plus registration/macaroon/form
//!    secrets, generated once and never rotated by the operator
//! 2. **Configuration ConfigMap** - rendered homeserver.yaml and a static
//!    log configuration, annotated with a fingerprint of its inputs so
//!    stale configuration is re-rendered without spurious updates
//! 3. **Deployment** - a single Synapse replica mounting the above
//!
//! Dependents carry owner references, so deleting a Synapse cascades
//! through the cluster garbage collector.

use anyhow::Result;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{Api, Client};
use kube_runtime::{watcher, Controller};
use std::sync::Arc;
use tracing::info;

use synapse_operator::reconciler::{self, Context, Engine};
use synapse_operator::store::KubeStore;
use synapse_operator::Synapse;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "synapse_operator=info".into()),
        )
        .init();

    info!("Starting Synapse operator");

    let client = Client::try_default().await?;

    // Watch Synapse resources across all namespaces and wake up whenever
    // one of the owned dependents changes underneath us.
    let synapses: Api<Synapse> = Api::all(client.clone());
    let ctx = Arc::new(Context {
        engine: Engine::new(KubeStore::new(client.clone())),
    });

    Controller::new(synapses, watcher::Config::default())
        .owns(Api::<Secret>::all(client.clone()), watcher::Config::default())
        .owns(
            Api::<ConfigMap>::all(client.clone()),
            watcher::Config::default(),
        )
        .owns(Api::<Deployment>::all(client), watcher::Config::default())
        .shutdown_on_signal()
        .run(reconciler::reconcile, reconciler::error_policy, ctx)
        .for_each(|_| std::future::ready(()))
        .await;

    info!("Controller stopped");
    Ok(())
}
