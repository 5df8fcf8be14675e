//! Dummy adapter for local development.
//!
//! Echoes the rendered prompt back as its output without spawning any
//! subprocess, so pipelines can be exercised end to end on a machine with
//! no LLM CLI installed. Token counts are estimated from character
//! lengths.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Adapter, AdapterEvent, RunConfig, RunResult, TokenUsage};
use crate::error::WaveError;

pub struct DummyAdapter {
    context_window: u64,
}

impl DummyAdapter {
    pub fn new(context_window: u64) -> Self {
        Self { context_window }
    }
}

impl Default for DummyAdapter {
    fn default() -> Self {
        Self::new(200_000)
    }
}

#[async_trait]
impl Adapter for DummyAdapter {
    fn name(&self) -> &str {
        "dummy"
    }

    fn context_window(&self) -> u64 {
        self.context_window
    }

    async fn run(
        &self,
        config: RunConfig,
        events: mpsc::UnboundedSender<AdapterEvent>,
    ) -> Result<RunResult, WaveError> {
        if config.cancel.is_requested() {
            return Err(WaveError::Cancelled);
        }

        let output = format!("[dummy:{}] {}", config.persona, config.prompt);
        let usage = TokenUsage::estimate(config.prompt.len(), output.len());

        let _ = events.send(AdapterEvent::TokenUsage {
            delta: usage.total(),
            cumulative: usage.total(),
        });
        let _ = events.send(AdapterEvent::Text {
            content: output.clone(),
        });

        Ok(RunResult {
            output,
            usage,
            exit_code: 0,
            events_seen: 2,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::PermissionSet;
    use crate::types::CancelFlag;
    use std::path::PathBuf;
    use std::time::Duration;

    fn config(prompt: &str) -> RunConfig {
        RunConfig {
            workspace: PathBuf::from("."),
            persona: "navigator".into(),
            system_prompt_path: PathBuf::from("/dev/null"),
            prompt: prompt.into(),
            temperature: 0.2,
            permissions: PermissionSet::default(),
            hooks: vec![],
            timeout: Duration::from_secs(5),
            cancel: CancelFlag::new(),
        }
    }

    #[tokio::test]
    async fn echoes_prompt_with_persona_tag() {
        let adapter = DummyAdapter::default();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let result = adapter.run(config("say hello"), tx).await.unwrap();
        assert_eq!(result.output, "[dummy:navigator] say hello");
        assert_eq!(result.exit_code, 0);
        assert!(result.usage.total() > 0);

        assert!(matches!(
            rx.try_recv().unwrap(),
            AdapterEvent::TokenUsage { .. }
        ));
        assert!(matches!(rx.try_recv().unwrap(), AdapterEvent::Text { .. }));
    }

    #[tokio::test]
    async fn respects_prior_cancellation() {
        let adapter = DummyAdapter::default();
        let cfg = config("anything");
        cfg.cancel.request(false);
        let (tx, _rx) = mpsc::unbounded_channel();

        assert!(matches!(
            adapter.run(cfg, tx).await,
            Err(WaveError::Cancelled)
        ));
    }
}
