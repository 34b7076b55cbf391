//! Step 3: register the URI left by `ingest-model` with the model registry.

use anyhow::Result;
use tracing::{error, info};
use provision_core::{init_tracing, pipeline, HandoffFile, PipelineConfig, RestRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("register-model")?;
    let cfg = PipelineConfig::load()?;
    info!(?cfg, "config_loaded");

    let handoff = HandoffFile::new(&cfg.handoff_file);
    let connect = || {
        info!(registry = %cfg.registry.base_url(), "connecting to registry");
        RestRegistry::connect(&cfg.registry)
    };
    let registration = match pipeline::register_from_handoff(&handoff, connect, &cfg.registration).await {
        Ok(r) => r,
        Err(e) if e.is_missing_handoff() => {
            error!(error = %e, "handoff_missing");
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    };

    println!("\nSUCCESS: Model Registered!");
    println!("    ID: {}", registration.model_id);
    println!("    Version: {} ({})", registration.version, registration.version_id);
    println!("    Location: {}", registration.uri);
    println!("    Registry: {}", cfg.registry.base_url());
    Ok(())
}
