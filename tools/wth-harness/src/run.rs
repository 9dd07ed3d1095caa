//! Native run through the host adapter.

use std::path::Path;

use anyhow::Context;
use tracing::info;
use wth_host::{HostAdapter, HostConfig, TestReport};

pub async fn run(module: &Path, config: HostConfig) -> anyhow::Result<TestReport> {
    let bytes = tokio::fs::read(module)
        .await
        .with_context(|| format!("failed to read {}", module.display()))?;
    info!(path = %module.display(), size = bytes.len(), "running module");

    let adapter = HostAdapter::load(&bytes, config)?;
    let report = adapter.run().await?;
    Ok(report)
}
