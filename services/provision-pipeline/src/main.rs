//! All three steps in one process; the publish result goes straight to the
//! register step without the hand-off file.

use anyhow::Result;
use tracing::info;
use provision_core::{init_tracing, pipeline, HfHub, PipelineConfig, RestRegistry, S3Vault};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("provision-pipeline")?;
    let cfg = PipelineConfig::load()?;
    info!(?cfg, "config_loaded");

    let hub = HfHub::connect(&cfg.hub)?;
    let vault = S3Vault::connect(&cfg.store)?;
    let registry = RestRegistry::connect(&cfg.registry)?;

    let (report, registration) = pipeline::provision(&hub, &vault, &registry, &cfg).await?;
    println!("\nSUCCESS: {} objects published to {}", report.objects, report.uri);
    println!("    Model ID: {}", registration.model_id);
    println!("    Version: {} ({})", registration.version, registration.version_id);
    println!("    Registry: {}", cfg.registry.base_url());
    Ok(())
}
