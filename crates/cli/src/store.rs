use anyhow::{Context, Result};
use async_trait::async_trait;
use autotrader_core::{BalanceStore, DecisionRecord, DecisionStore, PerformanceSummary};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Decision records as JSON lines, one per cycle. Re-baselined balances go
/// to a sibling `<file>.baseline.json` keyed by `user/trader`.
pub struct JsonlStore {
    path: PathBuf,
}

impl JsonlStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn baseline_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".baseline.json");
        PathBuf::from(name)
    }

    /// Every record in the file. Unparseable lines are skipped with a warning.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read.
    pub async fn load(&self) -> Result<Vec<DecisionRecord>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read {}", self.path.display()))
            }
        };

        let mut records = Vec::new();
        for (line_no, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<DecisionRecord>(line) {
                Ok(record) => records.push(record),
                Err(err) => tracing::warn!(
                    path = %self.path.display(),
                    line = line_no + 1,
                    error = %err,
                    "skipping unreadable decision record"
                ),
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl DecisionStore for JsonlStore {
    async fn append(&self, record: &DecisionRecord) -> Result<()> {
        let mut line = serde_json::to_string(record).context("failed to encode decision record")?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn recent_performance(&self, window: usize) -> Result<Option<PerformanceSummary>> {
        let records = self.load().await?;
        let start = records.len().saturating_sub(window);
        Ok(PerformanceSummary::from_records(&records[start..]))
    }
}

#[async_trait]
impl BalanceStore for JsonlStore {
    async fn update_initial_balance(
        &self,
        user_id: &str,
        trader_id: &str,
        balance: f64,
    ) -> Result<()> {
        let path = self.baseline_path();
        let mut baselines: BTreeMap<String, f64> = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err).with_context(|| format!("failed to read {}", path.display())),
        };
        baselines.insert(format!("{user_id}/{trader_id}"), balance);

        let encoded = serde_json::to_string_pretty(&baselines)?;
        tokio::fs::write(&path, encoded)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        tracing::info!(user_id, trader_id, balance, "persisted initial balance");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autotrader_core::{Action, ActionRecord};
    use chrono::Utc;

    fn record_with_close(cycle: u64, pnl: f64) -> DecisionRecord {
        let mut record = DecisionRecord::new("t1", cycle, Utc::now());
        let mut action = ActionRecord::pending(Action::CloseLong, "BTCUSDT", Utc::now());
        action.success = true;
        action.realized_pnl = Some(pnl);
        record.actions.push(action);
        record
    }

    #[tokio::test]
    async fn appends_and_windows_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::new(dir.path().join("decisions.jsonl"));

        store.append(&record_with_close(1, -5.0)).await.unwrap();
        store.append(&record_with_close(2, 3.0)).await.unwrap();
        store.append(&record_with_close(3, 4.0)).await.unwrap();

        assert_eq!(store.load().await.unwrap().len(), 3);
        let summary = store.recent_performance(2).await.unwrap().unwrap();
        assert_eq!(summary.total_trades, 2);
        assert_eq!(summary.winning_trades, 2);
    }

    #[tokio::test]
    async fn missing_file_has_no_performance() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::new(dir.path().join("none.jsonl"));
        assert!(store.recent_performance(100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn baseline_is_keyed_by_user_and_trader() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::new(dir.path().join("decisions.jsonl"));

        store.update_initial_balance("u1", "t1", 900.0).await.unwrap();
        store.update_initial_balance("u1", "t2", 50.0).await.unwrap();

        let raw = std::fs::read_to_string(store.baseline_path()).unwrap();
        let baselines: BTreeMap<String, f64> = serde_json::from_str(&raw).unwrap();
        assert_eq!(baselines.get("u1/t1"), Some(&900.0));
        assert_eq!(baselines.len(), 2);
    }
}
