use crate::config::AppConfig;
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use std::path::Path;
use tracing::info;

const ENV_PREFIX: &str = "RISKGATE_";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Builds the layered figment: defaults, then the file, then environment.
    ///
    /// `.json` files are read as JSON, anything else as TOML. Environment keys use
    /// `__` for nesting, e.g. `RISKGATE_PORTFOLIO__MAX_LONGS=1`.
    #[must_use]
    pub fn figment(path: &Path) -> Figment {
        let base = Figment::from(Serialized::defaults(AppConfig::default()));
        let with_file = if path.extension().is_some_and(|ext| ext == "json") {
            base.merge(Json::file(path))
        } else {
            base.merge(Toml::file(path))
        };
        with_file.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Loads and validates the application configuration.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be parsed or validation fails.
    pub fn load(path: &Path) -> Result<AppConfig> {
        let config: AppConfig = Self::figment(path)
            .extract()
            .with_context(|| format!("failed to load config from {}", path.display()))?;
        config.validate().context("invalid configuration")?;

        info!(
            path = %path.display(),
            symbols = config.engine.symbols.len(),
            benchmark = %config.engine.benchmark_symbol,
            "configuration loaded"
        );
        Ok(config)
    }
}
