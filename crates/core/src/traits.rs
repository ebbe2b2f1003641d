use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::GatewayResult;
use crate::events::{BookTicker, InstrumentRules, Order, OrderRequest};
use crate::market::{FuseBar, MarketSnapshot};
use crate::position::PositionSnapshot;
use crate::signal::{EntrySignal, RegimeView};

/// Order, position and account access on the remote exchange.
///
/// The exchange is the only source of truth. Implementations must not cache.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    async fn get_position(&self, symbol: &str) -> GatewayResult<PositionSnapshot>;
    async fn get_open_orders(&self, symbol: &str) -> GatewayResult<Vec<Order>>;
    async fn place_order(&self, request: OrderRequest) -> GatewayResult<Order>;
    async fn cancel_order(&self, order_id: &str, symbol: &str) -> GatewayResult<()>;
    /// Account equity in quote currency.
    async fn get_balance(&self) -> GatewayResult<Decimal>;
    async fn get_mark_price(&self, symbol: &str) -> GatewayResult<Decimal>;
    async fn get_funding_rate(&self, symbol: &str) -> GatewayResult<Decimal>;
    async fn get_book_ticker(&self, symbol: &str) -> GatewayResult<BookTicker>;
    async fn get_instrument_rules(&self, symbol: &str) -> GatewayResult<InstrumentRules>;
}

/// Candle/indicator provider.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Indicators for the latest confirmed bar of `symbol`.
    async fn snapshot(&self, symbol: &str) -> anyhow::Result<MarketSnapshot>;

    /// Current short-timeframe bar of `symbol`, used by the crash fuse.
    async fn fuse_bar(&self, symbol: &str) -> anyhow::Result<Option<FuseBar>>;
}

/// Source of entry proposals.
pub trait SignalSource: Send + Sync {
    fn evaluate(&self, snapshot: &MarketSnapshot, regime: &RegimeView) -> Option<EntrySignal>;

    fn name(&self) -> &str;
}
