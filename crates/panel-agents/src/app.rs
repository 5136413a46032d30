//! Wiring between configuration, the file store, the generation backend and
//! the deliberation core.

use std::sync::Arc;

use anyhow::{Context, Result};
use deliberation::market::StaticMarketData;
use deliberation::{
    ChatMessage, Deliberation, DeliberationReport, FlowRequest, Frame, JsonFileStore,
    RetryingClient, ScriptedClient, SharedGenerationClient, SharedMarketData,
};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::PanelConfig;
use crate::market_data::YahooChartClient;
use crate::provider::OpenAiCompatClient;

/// An opened panel: store plus backends, ready to run flows.
pub struct Panel {
    config: PanelConfig,
    store: Arc<JsonFileStore>,
    client: SharedGenerationClient,
    market: SharedMarketData,
}

impl Panel {
    /// Open the store and build backends. `offline` swaps the provider for
    /// a local echo client and market data for an empty table.
    pub async fn open(config: PanelConfig, offline: bool) -> Result<Self> {
        config
            .validate()
            .map_err(anyhow::Error::msg)
            .context("Invalid panel configuration")?;

        let store = JsonFileStore::open(&config.store_path)
            .await
            .with_context(|| format!("Failed to open store {}", config.store_path.display()))?;

        let (client, market): (SharedGenerationClient, SharedMarketData) = if offline {
            info!("offline mode: echo generation, no market data");
            (
                Arc::new(ScriptedClient::echo()),
                Arc::new(StaticMarketData::default()),
            )
        } else {
            let api_key = config.require_api_key()?;
            let http = OpenAiCompatClient::new(&config.provider, api_key)
                .context("Failed to build provider client")?;
            let market = YahooChartClient::new(&config.market)
                .context("Failed to build market data client")?;
            info!(base_url = %config.provider.base_url, "provider client ready");
            (
                Arc::new(RetryingClient::new(http, config.deliberation.retry.clone())),
                Arc::new(market),
            )
        };

        Ok(Self::with_backends(config, Arc::new(store), client, market))
    }

    /// Assemble a panel from already-built parts.
    pub fn with_backends(
        config: PanelConfig,
        store: Arc<JsonFileStore>,
        client: SharedGenerationClient,
        market: SharedMarketData,
    ) -> Self {
        Self {
            config,
            store,
            client,
            market,
        }
    }

    pub fn config(&self) -> &PanelConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<JsonFileStore> {
        &self.store
    }

    pub fn orchestrator(&self) -> Result<Arc<Deliberation>> {
        let orchestrator = Deliberation::from_store(
            self.config.deliberation.clone(),
            self.store.clone(),
            self.client.clone(),
        )
        .context("Failed to build orchestrator")?
        .with_market_data(self.market.clone());
        Ok(orchestrator.shared())
    }

    /// Run one flow, writing its frames to `out` as SSE lines.
    pub async fn run<W>(&self, request: FlowRequest, out: W) -> Result<DeliberationReport>
    where
        W: AsyncWrite + Unpin,
    {
        let orchestrator = self.orchestrator()?;
        let (handle, frames, _cancel) = orchestrator.spawn(request);
        let written = pump_frames(frames, out).await;
        let report = handle.await.context("Deliberation task panicked")?;
        let written = written?;
        debug!(written, "frames written");
        Ok(report?)
    }

    /// Single-shot completion against `model`.
    pub async fn ping(&self, model: &str, prompt: &str) -> Result<String> {
        let reply = self
            .client
            .complete(&[ChatMessage::user(prompt)], model)
            .await
            .with_context(|| format!("Ping of {} failed", model))?;
        Ok(reply)
    }
}

/// Forward frames to `out` until the run ends. A write failure drops the
/// receiver, which cancels the run.
pub async fn pump_frames<W>(
    mut frames: mpsc::UnboundedReceiver<Frame>,
    mut out: W,
) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while let Some(frame) = frames.recv().await {
        let line = frame.to_sse().context("Failed to encode frame")?;
        if let Err(e) = write_line(&mut out, &line).await {
            warn!(error = %e, "output closed, cancelling run");
            return Ok(written);
        }
        written += 1;
    }
    out.flush().await.ok();
    Ok(written)
}

async fn write_line<W>(out: &mut W, line: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    out.write_all(line.as_bytes()).await?;
    out.flush().await
}
