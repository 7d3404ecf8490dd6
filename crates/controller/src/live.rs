//! Wiring against a real API server: discovery, watches on the view resources,
//! the change batcher and status writes.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::TryStreamExt;
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::ResourceExt;
use kview_core::{ObjectReader, TypeRegistry};
use kview_kubehub::{InformerManager, LiveClient, LiveWatchFactory};
use kview_plan::{PlanConfig, ReconcilerSet};
use kview_ownership::TreeConfig;
use kview_store::{spawn_batcher, LocaleResources};
use kview_eval::{EvalLimits, StateEvaluator};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::controller::{ControllerEvent, ViewController};
use crate::resources::{Definition, ReconciliationView, ViewDefinition};
use crate::status::KubeStatusWriter;
use crate::ControllerConfig;

/// Run the view controller against the current kube context until Ctrl-C.
/// `reconcilers` is the per-type logic simulated by dry runs.
pub async fn run(config: ControllerConfig, reconcilers: Arc<ReconcilerSet>) -> Result<()> {
    let client = kview_kubehub::connect().await?;
    let discovered = Arc::new(kview_kubehub::discover(client.clone()).await?);
    let registry = Arc::new(discovered.registry.clone());
    let live = LiveClient::new(client.clone(), Arc::clone(&discovered));

    let (batch_tx, batch_rx) = mpsc::channel(config.queue_cap.max(1));
    let event_tx = spawn_batcher(config.queue_cap, config.batch, batch_tx);
    let informers = Arc::new(InformerManager::new(Arc::new(LiveWatchFactory::new(live.clone())), event_tx));

    let (ctl_tx, ctl_rx) = mpsc::channel(config.queue_cap.max(1));
    tokio::spawn(log_exit("views", forward_views(Api::all(client.clone()), ctl_tx.clone())));
    tokio::spawn(log_exit(
        "view definitions",
        forward_definitions(Api::all(client.clone()), live.clone(), Arc::clone(&registry), ctl_tx),
    ));

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received; stopping view controller");
            on_signal.cancel();
        }
    });

    let controller = ViewController::new(registry, Arc::new(live), Arc::new(KubeStatusWriter::new(client)), informers)
        .with_config(config)
        .with_reconcilers(reconcilers)
        .with_evaluator(Arc::new(StateEvaluator::new(EvalLimits::from_env())))
        .with_plan_config(PlanConfig::from_env())
        .with_tree_config(TreeConfig::from_env());
    info!(types = discovered.registry.len(), "view controller ready");
    controller.run(ctl_rx, batch_rx, shutdown).await
}

async fn log_exit(what: &'static str, fut: impl std::future::Future<Output = Result<()>>) {
    match fut.await {
        Ok(()) => info!(watch = what, "watch ended"),
        Err(e) => warn!(watch = what, error = %e, "watch failed"),
    }
}

async fn forward_views(api: Api<ReconciliationView>, tx: mpsc::Sender<ControllerEvent>) -> Result<()> {
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    while let Some(ev) = stream.try_next().await.context("watching ReconciliationViews")? {
        let out: Vec<ControllerEvent> = match ev {
            Event::Applied(v) => vec![ControllerEvent::ViewApplied(v)],
            Event::Deleted(v) => vec![ControllerEvent::ViewDeleted(v)],
            Event::Restarted(list) => list.into_iter().map(ControllerEvent::ViewApplied).collect(),
        };
        for e in out {
            if tx.send(e).await.is_err() {
                return Ok(());
            }
        }
    }
    Ok(())
}

async fn forward_definitions(
    api: Api<ViewDefinition>,
    live: LiveClient,
    registry: Arc<TypeRegistry>,
    tx: mpsc::Sender<ControllerEvent>,
) -> Result<()> {
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    while let Some(ev) = stream.try_next().await.context("watching ViewDefinitions")? {
        let defs = match ev {
            Event::Applied(d) => vec![d],
            Event::Restarted(list) => list,
            Event::Deleted(d) => {
                if tx.send(ControllerEvent::DefinitionDeleted(d.name_any())).await.is_err() {
                    return Ok(());
                }
                continue;
            }
        };
        for def in defs {
            let name = def.name_any();
            let locale = match load_locale(&def, &live).await {
                Ok(locale) => locale,
                Err(e) => {
                    warn!(definition = %name, error = %e, "locale resource unavailable; using plain descriptions");
                    None
                }
            };
            match Definition::from_resource(&def, &registry, locale) {
                Ok(definition) => {
                    if tx.send(ControllerEvent::DefinitionApplied { name, definition }).await.is_err() {
                        return Ok(());
                    }
                }
                Err(e) => warn!(definition = %name, error = %e, "invalid view definition"),
            }
        }
    }
    Ok(())
}

async fn load_locale(def: &ViewDefinition, live: &LiveClient) -> kview_core::Result<Option<Arc<LocaleResources>>> {
    let Some(cm_ref) = &def.spec.locale_resource else { return Ok(None) };
    let cm = live.get(&cm_ref.object_ref()).await?;
    Ok(Some(Arc::new(LocaleResources::from_config_map(&cm)?)))
}
