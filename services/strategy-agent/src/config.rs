//! Strategy and agent configuration

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration errors, raised at construction time
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse strategy file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Failed to load settings: {0}")]
    Settings(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Full request for one strategy, persisted as the strategy config
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserRequest {
    #[serde(default)]
    pub llm_model_config: LlmModelConfig,
    #[serde(default)]
    pub exchange_config: ExchangeConfig,
    #[serde(default)]
    pub trading_config: TradingConfig,
}

impl UserRequest {
    /// Load a strategy request from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut request: UserRequest = serde_yaml::from_str(&raw)?;
        request.canonicalize_symbols()?;
        request.validate()?;
        Ok(request)
    }

    /// Rewrite `trading_config.symbols` to canonical "BASE-QUOTE" form,
    /// dropping duplicates. Market data is keyed by the canonical form.
    pub fn canonicalize_symbols(&mut self) -> Result<()> {
        let mut canonical: Vec<String> = Vec::with_capacity(self.trading_config.symbols.len());
        for raw in &self.trading_config.symbols {
            let symbol = market_data::normalize_symbol(raw).ok_or_else(|| {
                ConfigError::Invalid(format!("trading_config.symbols: cannot parse '{}'", raw))
            })?;
            if !canonical.contains(&symbol) {
                canonical.push(symbol);
            }
        }
        self.trading_config.symbols = canonical;
        Ok(())
    }

    /// Reject requests that cannot run
    pub fn validate(&self) -> Result<()> {
        let trading = &self.trading_config;
        if trading.symbols.is_empty() {
            return Err(ConfigError::Invalid(
                "trading_config.symbols must not be empty".into(),
            ));
        }
        if let Some(bad) = trading
            .symbols
            .iter()
            .find(|s| market_data::normalize_symbol(s).is_none())
        {
            return Err(ConfigError::Invalid(format!(
                "trading_config.symbols: cannot parse '{}'",
                bad
            )));
        }
        if trading.initial_capital < Decimal::ZERO {
            return Err(ConfigError::Invalid(
                "trading_config.initial_capital must be >= 0".into(),
            ));
        }
        if trading.max_leverage < Decimal::ONE {
            return Err(ConfigError::Invalid(
                "trading_config.max_leverage must be >= 1".into(),
            ));
        }
        if trading.decide_interval == 0 {
            return Err(ConfigError::Invalid(
                "trading_config.decide_interval must be > 0".into(),
            ));
        }
        let grid = &trading.grid;
        if grid.step_pct <= Decimal::ZERO || grid.base_fraction <= Decimal::ZERO {
            return Err(ConfigError::Invalid(
                "grid.step_pct and grid.base_fraction must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Market type, inferring spot from a leverage of 1 when unset
    pub fn market_type(&self) -> MarketType {
        self.exchange_config
            .market_type
            .unwrap_or(if self.trading_config.max_leverage <= Decimal::ONE {
                MarketType::Spot
            } else {
                MarketType::Swap
            })
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TradingMode {
    #[default]
    Virtual,
    Live,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MarketType {
    Spot,
    Future,
    #[default]
    Swap,
}

impl MarketType {
    pub fn is_spot(&self) -> bool {
        matches!(self, MarketType::Spot)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MarginMode {
    #[default]
    Cross,
    Isolated,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StrategyType {
    #[default]
    Prompt,
    Grid,
}

/// LLM provider settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// OpenAI-compatible endpoint root, e.g. https://api.openai.com/v1
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Default for LlmModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model_id: default_model_id(),
            api_key: None,
            base_url: None,
        }
    }
}

/// Exchange connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default)]
    pub exchange_id: Option<String>,
    #[serde(default)]
    pub trading_mode: TradingMode,
    /// Unset means "infer from max_leverage"
    #[serde(default)]
    pub market_type: Option<MarketType>,
    #[serde(default)]
    pub margin_mode: MarginMode,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub testnet: bool,
    /// Paper fee in basis points
    #[serde(default = "default_fee_bps")]
    pub fee_bps: Decimal,
    /// Override for the REST endpoint, used by tests and proxies
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            exchange_id: None,
            trading_mode: TradingMode::default(),
            market_type: None,
            margin_mode: MarginMode::default(),
            api_key: None,
            secret_key: None,
            passphrase: None,
            testnet: false,
            fee_bps: default_fee_bps(),
            base_url: None,
        }
    }
}

/// Grid strategy parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridParams {
    /// Distance between grid levels as a fraction (0.005 = 0.5%)
    #[serde(default = "default_step_pct")]
    pub step_pct: Decimal,
    /// Max steps acted on per symbol and per cycle
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    /// Fraction of equity per step
    #[serde(default = "default_base_fraction")]
    pub base_fraction: Decimal,
}

impl Default for GridParams {
    fn default() -> Self {
        Self {
            step_pct: default_step_pct(),
            max_steps: default_max_steps(),
            base_fraction: default_base_fraction(),
        }
    }
}

/// Trading parameters for one strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingConfig {
    #[serde(default)]
    pub strategy_name: Option<String>,
    #[serde(default)]
    pub strategy_type: StrategyType,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default = "default_initial_capital")]
    pub initial_capital: Decimal,
    #[serde(default = "default_max_leverage")]
    pub max_leverage: Decimal,
    #[serde(default = "default_max_positions")]
    pub max_positions: u32,
    /// Seconds between decision cycles
    #[serde(default = "default_decide_interval")]
    pub decide_interval: u64,
    /// Multiple of equity a single order may add
    #[serde(default = "default_cap_factor")]
    pub cap_factor: Decimal,
    #[serde(default)]
    pub custom_prompt: Option<String>,
    #[serde(default)]
    pub prompt_text: Option<String>,
    #[serde(default)]
    pub grid: GridParams,
}

impl TradingConfig {
    pub fn decide_every(&self) -> Duration {
        Duration::from_secs(self.decide_interval)
    }
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            strategy_name: None,
            strategy_type: StrategyType::default(),
            symbols: Vec::new(),
            initial_capital: default_initial_capital(),
            max_leverage: default_max_leverage(),
            max_positions: default_max_positions(),
            decide_interval: default_decide_interval(),
            cap_factor: default_cap_factor(),
            custom_prompt: None,
            prompt_text: None,
            grid: GridParams::default(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model_id() -> String {
    "gpt-4o-mini".to_string()
}

fn default_fee_bps() -> Decimal {
    Decimal::from(10)
}

fn default_step_pct() -> Decimal {
    Decimal::new(5, 3)
}

fn default_max_steps() -> u32 {
    3
}

fn default_base_fraction() -> Decimal {
    Decimal::new(8, 2)
}

fn default_initial_capital() -> Decimal {
    Decimal::from(100_000)
}

fn default_max_leverage() -> Decimal {
    Decimal::from(10)
}

fn default_max_positions() -> u32 {
    5
}

fn default_decide_interval() -> u64 {
    60
}

fn default_cap_factor() -> Decimal {
    Decimal::new(15, 1)
}

/// Env var pointing at an optional settings file
pub const SETTINGS_FILE_ENV: &str = "STRATEGY_AGENT_CONFIG";

/// Process-level settings for the agent binary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSettings {
    pub database_url: String,
    #[serde(default)]
    pub strategy_file: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub autoresume: bool,
    #[serde(default)]
    pub close_positions_on_stop: bool,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

fn default_true() -> bool {
    true
}

fn default_max_consecutive_failures() -> u32 {
    5
}

impl AgentSettings {
    /// Defaults, then the optional settings file, then STRATEGY_AGENT_* env vars
    pub fn load() -> Result<Self> {
        let file = std::env::var(SETTINGS_FILE_ENV).ok().map(PathBuf::from);
        Self::load_from(file.as_deref())
    }

    pub fn load_from(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("database_url", default_database_url())?
            .set_default("autoresume", true)?
            .set_default("close_positions_on_stop", false)?
            .set_default("max_consecutive_failures", 5_i64)?;

        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let settings = builder
            .add_source(config::Environment::with_prefix("STRATEGY_AGENT").try_parsing(true))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

/// sqlite file under the platform data dir
pub fn default_database_url() -> String {
    let dir = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("strategy-agent");
    format!("sqlite://{}/strategy-agent.db?mode=rwc", dir.display())
}
