use anyhow::{Context, Result};
use async_trait::async_trait;
use autotrader_core::{
    Decision, DecisionBundle, DecisionSource, DecisionSourceError, PromptOptions, TradingContext,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;

const SYSTEM_PROMPT: &str = "scripted decision source: replays one batch per cycle";

/// Replays pre-recorded decision batches, one per cycle. Once the script is
/// exhausted every cycle gets an empty batch.
pub struct ScriptedDecisions {
    batches: Mutex<VecDeque<Vec<Decision>>>,
}

impl ScriptedDecisions {
    #[must_use]
    pub fn new(batches: Vec<Vec<Decision>>) -> Self {
        Self {
            batches: Mutex::new(batches.into()),
        }
    }

    /// Reads a JSON array of decision arrays.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read decisions file {}", path.display()))?;
        let batches: Vec<Vec<Decision>> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse decisions file {}", path.display()))?;
        Ok(Self::new(batches))
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.batches.lock().len()
    }
}

#[async_trait]
impl DecisionSource for ScriptedDecisions {
    async fn decide(
        &self,
        context: &TradingContext,
        options: &PromptOptions,
    ) -> Result<DecisionBundle, DecisionSourceError> {
        let user_prompt = serde_json::to_string_pretty(context)
            .context("failed to render trading context")?;
        let system_prompt = match (&options.custom_prompt, options.override_base) {
            (Some(custom), true) => custom.clone(),
            (Some(custom), false) => format!("{SYSTEM_PROMPT}\n\n{custom}"),
            (None, _) => SYSTEM_PROMPT.to_string(),
        };
        let decisions = self.batches.lock().pop_front().unwrap_or_default();

        Ok(DecisionBundle {
            system_prompt,
            user_prompt,
            cot_trace: format!(
                "template={} cycle={} batch_size={}",
                options.template,
                context.call_count,
                decisions.len()
            ),
            decisions,
        })
    }
}
