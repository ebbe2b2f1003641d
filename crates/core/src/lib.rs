pub mod config;
pub mod config_loader;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod market;
pub mod order_class;
pub mod persistence;
pub mod position;
pub mod position_sizing;
pub mod retry;
pub mod shutdown;
pub mod signal;
pub mod traits;

pub use config::{AppConfig, ConfigError};
pub use config_loader::ConfigLoader;
pub use error::{GatewayError, GatewayResult};
pub use events::{BookTicker, ExchangeEvent, InstrumentRules, Order, OrderRequest, OrderSide, OrderType};
pub use fingerprint::{SetupContext, SetupFingerprint};
pub use market::{FuseBar, MarketGate, MarketSnapshot, Regime, TrendDirection};
pub use order_class::{classify, is_protective, is_target, OrderClass};
pub use persistence::{JsonStore, PersistenceError};
pub use position::{Position, PositionSnapshot, Side};
pub use position_sizing::risk_based_quantity;
pub use retry::{retry_call, RetryPolicy};
pub use signal::{EntrySignal, RegimeView};
pub use traits::{ExchangeGateway, MarketDataProvider, SignalSource};
