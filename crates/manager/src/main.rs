//! Patchloop - Main Entry Point
//!
//! Loads the configuration, maps the configured model copy-on-write, attaches
//! every hotpatch layer and runs until interrupted.

use anyhow::Context;
use memmap2::MmapOptions;
use patchloop_common::{HotpatchConfig, METRICS};
use patchloop_manager::UnifiedHotpatchManager;
use std::fs::File;
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("PATCHLOOP_CONFIG").ok().map(PathBuf::from);
    let config = HotpatchConfig::load(config_path.as_deref())?;

    init_tracing(&config);
    info!("Starting Patchloop");
    if let Some(path) = &config_path {
        info!("Configuration loaded from {}", path.display());
    }

    let manager = UnifiedHotpatchManager::new(config.clone());
    let init = manager.initialize();
    if !init.success {
        anyhow::bail!("initialization failed: {}", init.detail);
    }

    // Kept alive until detach_all below
    let mut mapping = None;
    if let Some(model) = &config.model {
        let file = File::open(&model.path)
            .with_context(|| format!("opening model {}", model.path.display()))?;
        // SAFETY: a private copy-on-write mapping; writes never reach the file
        let mut mmap = unsafe { MmapOptions::new().map_copy(&file) }
            .with_context(|| format!("mapping model {}", model.path.display()))?;

        let byte_path = model.load_byte_layer.then_some(model.path.as_path());
        // SAFETY: the mapping outlives the attachment; it is dropped after detach_all
        let attached = unsafe { manager.attach_to_model(mmap.as_mut_ptr(), mmap.len(), byte_path) };
        if attached.success {
            info!("{}", attached.detail);
        } else {
            error!("Attach failed: {}", attached.detail);
        }
        mapping = Some(mmap);
    } else {
        warn!("No model configured; only the pipeline layers are active");
    }

    info!("Patchloop running (session {})", manager.statistics().session_id);

    signal::ctrl_c().await?;
    info!("Received shutdown signal");

    let detached = manager.detach_all();
    if !detached.success || detached.error_code != 0 {
        error!("Detach reported: {}", detached.detail);
    }
    drop(mapping);

    println!("{}", serde_json::to_string_pretty(&manager.statistics())?);
    if config.observability.enable_metrics {
        println!("{}", METRICS.gather());
    }

    info!("Patchloop shutdown complete");
    Ok(())
}

fn init_tracing(config: &HotpatchConfig) {
    let level = &config.observability.log_level;
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "patchloop={level},patchloop_manager={level},patchloop_engine={level},patchloop_pipeline={level}"
        )
        .into()
    });

    let registry = tracing_subscriber::registry().with(filter);
    if config.observability.structured_logging {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
