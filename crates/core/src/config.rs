use crate::error::ConfigError;
use crate::types::{LeveragePolicy, PromptOptions};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Venues the engine knows how to drive.
pub const SUPPORTED_VENUES: [&str; 4] = ["binance", "hyperliquid", "aster", "paper"];

/// Margin mode applied before each open.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MarginMode {
    #[default]
    Cross,
    Isolated,
}

impl MarginMode {
    #[must_use]
    pub const fn is_cross(self) -> bool {
        matches!(self, Self::Cross)
    }
}

/// Configuration for one trading identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraderConfig {
    pub id: String,
    pub name: String,
    pub user_id: String,
    pub venue: String,
    pub initial_balance: f64,
    pub scan_interval_secs: u64,
    pub leverage: LeveragePolicy,
    pub margin_mode: MarginMode,
    /// Symbols chosen by the operator; take precedence over everything else.
    pub custom_symbols: Vec<String>,
    /// Fallback symbols used when no custom symbols are set.
    pub default_symbols: Vec<String>,
    /// Number of symbols requested from the candidate pool.
    pub candidate_limit: usize,
    pub prompt: PromptOptions,
    /// Number of past decision records used for the performance summary.
    pub performance_window: usize,
    pub risk: RiskPolicy,
    pub breaker: BreakerConfig,
    pub monitor_interval_secs: u64,
    pub post_success_delay_ms: u64,
    pub balance_sync_interval_secs: u64,
    /// Percentage change in wallet balance that triggers a baseline rewrite.
    pub balance_drift_pct: f64,
}

impl Default for TraderConfig {
    fn default() -> Self {
        Self {
            id: "trader".to_string(),
            name: "trader".to_string(),
            user_id: "default".to_string(),
            venue: String::new(),
            initial_balance: 0.0,
            scan_interval_secs: 180,
            leverage: LeveragePolicy {
                btc_eth: 5,
                altcoin: 5,
            },
            margin_mode: MarginMode::Cross,
            custom_symbols: Vec::new(),
            default_symbols: Vec::new(),
            candidate_limit: 20,
            prompt: PromptOptions {
                template: "default".to_string(),
                custom_prompt: None,
                override_base: false,
            },
            performance_window: 100,
            risk: RiskPolicy::default(),
            breaker: BreakerConfig::default(),
            monitor_interval_secs: 60,
            post_success_delay_ms: 1000,
            balance_sync_interval_secs: 600,
            balance_drift_pct: 5.0,
        }
    }
}

impl TraderConfig {
    /// Checks the settings that make construction impossible.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the initial balance is not positive, the
    /// venue is unsupported, or an interval is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_balance <= 0.0 || !self.initial_balance.is_finite() {
            return Err(ConfigError::MissingInitialBalance(self.initial_balance));
        }

        let venue = self.venue.to_ascii_lowercase();
        if !SUPPORTED_VENUES.contains(&venue.as_str()) {
            return Err(ConfigError::UnsupportedVenue(self.venue.clone()));
        }

        if self.scan_interval_secs == 0 {
            return Err(ConfigError::InvalidInterval {
                name: "scan_interval_secs",
            });
        }
        if self.monitor_interval_secs == 0 {
            return Err(ConfigError::InvalidInterval {
                name: "monitor_interval_secs",
            });
        }
        if self.balance_sync_interval_secs == 0 {
            return Err(ConfigError::InvalidInterval {
                name: "balance_sync_interval_secs",
            });
        }

        Ok(())
    }

    #[must_use]
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    #[must_use]
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    #[must_use]
    pub fn post_success_delay(&self) -> Duration {
        Duration::from_millis(self.post_success_delay_ms)
    }

    #[must_use]
    pub fn balance_sync_interval(&self) -> Duration {
        Duration::from_secs(self.balance_sync_interval_secs)
    }
}

/// Pre-trade guardrail thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RiskPolicy {
    pub min_confidence: u8,
    /// Longs are rejected above this mid-term RSI.
    pub long_rsi_ceiling: f64,
    /// Shorts are rejected below this mid-term RSI.
    pub short_rsi_floor: f64,
    /// Allowed distance from EMA20, in mid-term ATRs.
    pub ema_atr_band: f64,
    /// Maximum counter-trend slope between the last two short-horizon RSI samples.
    pub rsi_slope_tolerance: f64,
    pub safety_buffer_min: f64,
    pub safety_buffer_pct: f64,
    pub major_symbols: Vec<String>,
    pub major_min_notional: f64,
    pub min_notional: f64,
    pub small_account_equity: f64,
    pub soft_cap_multiple: f64,
    pub major_soft_cap_multiple: f64,
    /// Share of available balance that `risk_usd` may never exceed.
    pub max_risk_pct: f64,
    pub risk_target_pct: f64,
    pub risk_target_min: f64,
    /// Relative deviation from the risk target tolerated before normalising.
    pub risk_tolerance: f64,
    pub taker_fee_rate: f64,
    /// Stop distance ceiling as a share of price.
    pub max_stop_distance_pct: f64,
    /// Stop distance ceiling in mid-term ATRs.
    pub max_stop_mid_atr_multiple: f64,
    /// Venue step sizes by symbol; overrides the prefix heuristic.
    pub step_overrides: HashMap<String, Decimal>,
}

impl Default for RiskPolicy {
    fn default() -> Self {
        Self {
            min_confidence: 80,
            long_rsi_ceiling: 68.0,
            short_rsi_floor: 32.0,
            ema_atr_band: 0.6,
            rsi_slope_tolerance: 0.2,
            safety_buffer_min: 0.5,
            safety_buffer_pct: 0.02,
            major_symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            major_min_notional: 60.0,
            min_notional: 12.0,
            small_account_equity: 150.0,
            soft_cap_multiple: 1.5,
            major_soft_cap_multiple: 3.0,
            max_risk_pct: 0.8,
            risk_target_pct: 0.005,
            risk_target_min: 0.5,
            risk_tolerance: 0.5,
            taker_fee_rate: 0.0004,
            max_stop_distance_pct: 0.015,
            max_stop_mid_atr_multiple: 1.5,
            step_overrides: HashMap::new(),
        }
    }
}

impl RiskPolicy {
    #[must_use]
    pub fn is_major(&self, symbol: &str) -> bool {
        self.major_symbols
            .iter()
            .any(|major| major.eq_ignore_ascii_case(symbol))
    }
}

/// Consecutive-loss pause schedule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BreakerConfig {
    /// Realized PnL magnitude below this is neither a win nor a loss.
    pub pnl_epsilon: f64,
    pub second_loss_pause_mins: i64,
    pub third_loss_pause_mins: i64,
    pub extended_pause_mins: i64,
    pub daily_reset_hours: i64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            pnl_epsilon: 1e-6,
            second_loss_pause_mins: 45,
            third_loss_pause_mins: 24 * 60,
            extended_pause_mins: 72 * 60,
            daily_reset_hours: 24,
        }
    }
}
