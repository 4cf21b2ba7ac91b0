mod remote;
mod worker;

use anyhow::Result;
use common::background::SilhouetteBackground;
use common::executor::Executor;
use common::model_cache::ModelCache;
use common::naming::NamingConvention;
use common::registry::{StageContext, StageRegistry};
use common::segmenter::BuiltinLoader;
use reqwest::Client;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::remote::{HttpDispatcher, HttpStore};
use crate::worker::WorkerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("worker=debug,common=info,reqwest=info")),
        )
        .init();

    let config = WorkerConfig::from_env();
    let client = Client::new();

    // el cache de modelos vive lo que vive el proceso
    let ctx = StageContext {
        store: Arc::new(HttpStore::new(client.clone(), &config.master_url)),
        dispatcher: Arc::new(HttpDispatcher::new(client, &config.master_url)),
        models: Arc::new(ModelCache::new(Arc::new(BuiltinLoader))),
        background: Arc::new(SilhouetteBackground),
        naming: NamingConvention::from_env(),
    };
    let registry = StageRegistry::standard();
    info!("{} etapas registradas", registry.len());

    worker::run(config, Executor::new(Arc::new(registry), ctx)).await
}
