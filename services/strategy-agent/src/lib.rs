//! Strategy Agent Library
//!
//! Decision flow for crypto trading strategies: market data feeds the
//! feature pipeline, a composer (LLM or grid) turns features and the
//! portfolio view into normalized instructions, the execution gateway fills
//! them and every cycle is recorded to history and the repository.

pub mod config;
pub mod coordinator;
pub mod decision;
pub mod execution;
pub mod features;
pub mod history;
pub mod llm_client;
pub mod persistence;
pub mod portfolio;
pub mod runner;
pub mod runtime;
pub mod types;

// Re-export main types for convenience
pub use config::{
    AgentSettings, ExchangeConfig, GridParams, LlmModelConfig, MarketType, StrategyType,
    TradingConfig, TradingMode, UserRequest,
};
pub use coordinator::{CoordinatorComponents, DecisionCoordinator};
pub use decision::{Composer, GridComposer, LlmComposer, PlanNormalizer};
pub use execution::{create_execution_gateway, ExecutionGateway, PaperExecutionGateway};
pub use features::{DefaultFeaturesPipeline, FeaturesPipeline};
pub use persistence::StrategyRepository;
pub use portfolio::{InMemoryPortfolioService, PortfolioService};
pub use runner::{autoresume, Lifecycle, StrategyManager, StrategyRunner};
pub use runtime::{create_strategy_runtime, RuntimeOptions, StrategyRuntime};
