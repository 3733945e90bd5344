//! Development agent used by `replay` and the gateway tests.

use async_trait::async_trait;
use sb_dispatch::{AgentOutput, AgentRunner, RunRequest, SteerInbox};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Echoes the run prompt back as a final reply after `latency`.
///
/// Events steered into the turn before it finishes are appended to the echo.
#[derive(Debug, Clone, Default)]
pub struct EchoAgent {
    latency: Duration,
}

impl EchoAgent {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

#[async_trait]
impl AgentRunner for EchoAgent {
    async fn run(
        &self,
        request: RunRequest,
        steer: SteerInbox,
        replies: mpsc::Sender<AgentOutput>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(run_id = %request.run_id, "echo run cancelled");
                return Ok(());
            }
            _ = tokio::time::sleep(self.latency) => {}
        }

        let mut text = format!("echo: {}", request.prompt());
        while let Some(event) = steer.try_recv().await {
            text.push_str("\n(steered) ");
            text.push_str(&event.body);
        }
        steer.close().await;

        replies
            .send(AgentOutput::final_text(text))
            .await
            .map_err(|e| anyhow::anyhow!("reply channel closed: {e}"))?;
        Ok(())
    }
}
