use crate::config::TraderConfig;
use crate::error::ConfigError;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use std::path::Path;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads `config/Trader.toml` merged with `AUTOTRADER_` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be parsed or fails validation.
    pub fn load() -> Result<TraderConfig, ConfigError> {
        Self::load_from("config/Trader.toml")
    }

    /// Loads configuration from a specific TOML file, then applies environment
    /// overrides. Nested keys use `__`, e.g. `AUTOTRADER_RISK__MIN_CONFIDENCE`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be parsed or fails validation.
    pub fn load_from(path: impl AsRef<Path>) -> Result<TraderConfig, ConfigError> {
        let config: TraderConfig = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("AUTOTRADER_").split("__"))
            .extract()?;

        config.validate()?;
        tracing::debug!(
            trader_id = %config.id,
            venue = %config.venue,
            "loaded trader configuration"
        );

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use rust_decimal_macros::dec;

    #[test]
    fn loads_toml_with_env_overrides() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "Trader.toml",
                r#"
                id = "alpha"
                venue = "hyperliquid"
                initial_balance = 500.0

                [risk]
                min_confidence = 85

                [risk.step_overrides]
                SOLUSDT = 0.01
                "#,
            )?;
            jail.set_env("AUTOTRADER_RISK__RISK_TOLERANCE", "0.25");
            jail.set_env("AUTOTRADER_SCAN_INTERVAL_SECS", "60");

            let config = ConfigLoader::load_from("Trader.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.id, "alpha");
            assert_eq!(config.risk.min_confidence, 85);
            assert!((config.risk.risk_tolerance - 0.25).abs() < 1e-12);
            assert_eq!(config.scan_interval_secs, 60);
            assert_eq!(config.risk.step_overrides.get("SOLUSDT"), Some(&dec!(0.01)));
            // untouched knobs keep their defaults
            assert!((config.risk.long_rsi_ceiling - 68.0).abs() < 1e-12);
            assert_eq!(config.monitor_interval_secs, 60);
            Ok(())
        });
    }

    #[test]
    fn invalid_file_is_a_configuration_error() {
        Jail::expect_with(|jail| {
            jail.create_file("Trader.toml", "venue = \"ftx\"\ninitial_balance = 10.0\n")?;
            let err = ConfigLoader::load_from("Trader.toml").unwrap_err();
            assert!(matches!(err, ConfigError::UnsupportedVenue(_)));
            Ok(())
        });
    }
}
