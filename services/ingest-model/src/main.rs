//! Steps 1 and 2: acquire the model from the hub, publish it to the object
//! store and leave the storage URI in the hand-off file for `register-model`.

use anyhow::Result;
use tracing::info;
use provision_core::{init_tracing, pipeline, HandoffFile, HfHub, PipelineConfig, S3Vault};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("ingest-model")?;
    let cfg = PipelineConfig::load()?;
    info!(?cfg, "config_loaded");

    let hub = HfHub::connect(&cfg.hub)?;
    let vault = S3Vault::connect(&cfg.store)?;
    let handoff = HandoffFile::new(&cfg.handoff_file);

    let report = pipeline::ingest(&hub, &vault, &handoff, &cfg).await?;
    println!("\nSUCCESS: Model secured at {}", report.uri);
    println!("    Objects: {} ({} bytes)", report.objects, report.bytes);
    println!("    Hand-off: {}", handoff.path().display());
    Ok(())
}
