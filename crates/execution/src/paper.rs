//! In-memory exchange for dry runs and deterministic tests.
//!
//! Market orders fill at the mark price. Stop and take-profit orders rest until
//! [`PaperGateway::trigger_orders`] is called. Fault injection lets tests
//! reproduce the ugly cases: failed placements, orders that take a few polls to
//! show up, cancels that fail, positions closed behind the engine's back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use riskgate_core::order_class::{classify, OrderClass};
use riskgate_core::{
    BookTicker, ExchangeGateway, GatewayError, GatewayResult, InstrumentRules, Order, OrderRequest,
    OrderSide, OrderType, PositionSnapshot, Side,
};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Protection state observed right after one gateway mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProtectionSample {
    pub symbol: String,
    pub operation: String,
    pub position_qty: Decimal,
    pub protective_orders: usize,
    pub target_orders: usize,
}

#[derive(Debug, Clone)]
struct PaperPosition {
    side: Side,
    quantity: Decimal,
    entry_price: Decimal,
}

#[derive(Debug, Clone)]
struct RestingOrder {
    order: Order,
    hidden_polls: u32,
}

/// A fill produced by a market order or a triggered resting order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaperFill {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub price: Decimal,
    pub realized_pnl: Decimal,
    pub fee: Decimal,
    pub time: DateTime<Utc>,
}

#[derive(Debug)]
struct PaperState {
    balance: Decimal,
    fee_rate: Decimal,
    positions: HashMap<String, PaperPosition>,
    orders: HashMap<String, Vec<RestingOrder>>,
    marks: HashMap<String, Decimal>,
    funding: HashMap<String, Decimal>,
    tickers: HashMap<String, BookTicker>,
    rules: HashMap<String, InstrumentRules>,
    next_id: u64,
    fail_places: u32,
    fail_closes: u32,
    hide_polls: u32,
    fail_cancels: HashSet<String>,
    fail_reads: u32,
    timeline: Vec<ProtectionSample>,
    fills: Vec<PaperFill>,
}

#[derive(Debug)]
pub struct PaperGateway {
    state: Mutex<PaperState>,
}

impl PaperGateway {
    #[must_use]
    pub fn new(balance: Decimal) -> Self {
        Self {
            state: Mutex::new(PaperState {
                balance,
                fee_rate: Decimal::new(4, 4),
                positions: HashMap::new(),
                orders: HashMap::new(),
                marks: HashMap::new(),
                funding: HashMap::new(),
                tickers: HashMap::new(),
                rules: HashMap::new(),
                next_id: 1,
                fail_places: 0,
                fail_closes: 0,
                hide_polls: 0,
                fail_cancels: HashSet::new(),
                fail_reads: 0,
                timeline: Vec::new(),
                fills: Vec::new(),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Market setup
    // ------------------------------------------------------------------

    pub fn set_mark_price(&self, symbol: &str, price: Decimal) {
        self.state.lock().marks.insert(symbol.to_string(), price);
    }

    pub fn set_balance(&self, balance: Decimal) {
        self.state.lock().balance = balance;
    }

    pub fn set_fee_rate(&self, fee_rate: Decimal) {
        self.state.lock().fee_rate = fee_rate;
    }

    pub fn set_funding_rate(&self, symbol: &str, rate: Decimal) {
        self.state.lock().funding.insert(symbol.to_string(), rate);
    }

    pub fn set_book_ticker(&self, symbol: &str, ticker: BookTicker) {
        self.state.lock().tickers.insert(symbol.to_string(), ticker);
    }

    pub fn set_instrument_rules(&self, symbol: &str, rules: InstrumentRules) {
        self.state.lock().rules.insert(symbol.to_string(), rules);
    }

    /// Puts a position on the book without going through an order.
    pub fn seed_position(&self, symbol: &str, side: Side, quantity: Decimal, entry_price: Decimal) {
        let mut state = self.state.lock();
        state.positions.insert(
            symbol.to_string(),
            PaperPosition {
                side,
                quantity,
                entry_price,
            },
        );
        state.marks.entry(symbol.to_string()).or_insert(entry_price);
    }

    /// Rests an arbitrary order, visible immediately. Returns its id.
    pub fn seed_order(
        &self,
        symbol: &str,
        order_type: &str,
        side: OrderSide,
        quantity: Decimal,
        trigger_price: Option<Decimal>,
        reduce_only: bool,
    ) -> String {
        let mut state = self.state.lock();
        let order_id = next_order_id(&mut state);
        let order = Order {
            order_id: order_id.clone(),
            symbol: symbol.to_string(),
            order_type: order_type.to_string(),
            side,
            quantity,
            trigger_price,
            reduce_only,
            close_position: false,
        };
        state
            .orders
            .entry(symbol.to_string())
            .or_default()
            .push(RestingOrder {
                order,
                hidden_polls: 0,
            });
        record_sample(&mut state, symbol, "seed_order");
        order_id
    }

    // ------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------

    /// The next `n` placements fail with a network error.
    pub fn fail_next_places(&self, n: u32) {
        self.state.lock().fail_places = n;
    }

    /// The next `n` reduce-only market orders fail with a network error.
    pub fn fail_next_closes(&self, n: u32) {
        self.state.lock().fail_closes = n;
    }

    /// New resting orders stay out of open-order listings for `polls` queries.
    pub fn hide_new_orders_for(&self, polls: u32) {
        self.state.lock().hide_polls = polls;
    }

    /// Cancels of `order_id` fail with a network error.
    pub fn fail_cancel(&self, order_id: &str) {
        self.state.lock().fail_cancels.insert(order_id.to_string());
    }

    /// The next `n` read calls fail with a network error.
    pub fn fail_next_reads(&self, n: u32) {
        self.state.lock().fail_reads = n;
    }

    /// Closes the position outside the engine (liquidation, manual close),
    /// leaving its orders behind.
    pub fn flatten(&self, symbol: &str) {
        let mut state = self.state.lock();
        state.positions.remove(symbol);
        record_sample(&mut state, symbol, "flatten");
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    /// Every resting order of `symbol`, hidden ones included.
    #[must_use]
    pub fn all_orders(&self, symbol: &str) -> Vec<Order> {
        self.state
            .lock()
            .orders
            .get(symbol)
            .map(|v| v.iter().map(|r| r.order.clone()).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn position_quantity(&self, symbol: &str) -> Decimal {
        self.state
            .lock()
            .positions
            .get(symbol)
            .map_or(Decimal::ZERO, |p| p.quantity)
    }

    #[must_use]
    pub fn timeline(&self) -> Vec<ProtectionSample> {
        self.state.lock().timeline.clone()
    }

    #[must_use]
    pub fn fills(&self) -> Vec<PaperFill> {
        self.state.lock().fills.clone()
    }

    #[must_use]
    pub fn balance(&self) -> Decimal {
        self.state.lock().balance
    }

    /// Fills resting stops and targets whose trigger the mark has crossed.
    pub fn trigger_orders(&self, symbol: &str) -> Vec<PaperFill> {
        let mut state = self.state.lock();
        let Some(mark) = state.marks.get(symbol).copied() else {
            return Vec::new();
        };
        let resting = state.orders.remove(symbol).unwrap_or_default();
        let mut keep = Vec::new();
        let mut fills = Vec::new();
        for r in resting {
            let Some(trigger) = r.order.trigger_price else {
                keep.push(r);
                continue;
            };
            let crossed = match (classify(&r.order), r.order.side) {
                (OrderClass::Target, OrderSide::Sell) => mark >= trigger,
                (OrderClass::Target, OrderSide::Buy) => mark <= trigger,
                (_, OrderSide::Sell) => mark <= trigger,
                (_, OrderSide::Buy) => mark >= trigger,
            };
            if !crossed {
                keep.push(r);
                continue;
            }
            if let Ok(fill) = fill_market(&mut state, symbol, r.order.side, r.order.quantity, true, &r.order.order_id) {
                fills.push(fill);
            }
        }
        if state.positions.get(symbol).is_none() {
            // reduce-only orders die with the position
            keep.retain(|r| !r.order.reduce_only && !r.order.close_position);
        }
        state.orders.insert(symbol.to_string(), keep);
        record_sample(&mut state, symbol, "trigger");
        fills
    }
}

fn next_order_id(state: &mut PaperState) -> String {
    let id = state.next_id;
    state.next_id += 1;
    format!("paper-{id}")
}

fn record_sample(state: &mut PaperState, symbol: &str, operation: &str) {
    let position_qty = state
        .positions
        .get(symbol)
        .map_or(Decimal::ZERO, |p| p.quantity);
    let (mut protective, mut targets) = (0, 0);
    for r in state.orders.get(symbol).into_iter().flatten() {
        match classify(&r.order) {
            OrderClass::Protective => protective += 1,
            OrderClass::Target => targets += 1,
            OrderClass::Other => {}
        }
    }
    state.timeline.push(ProtectionSample {
        symbol: symbol.to_string(),
        operation: operation.to_string(),
        position_qty,
        protective_orders: protective,
        target_orders: targets,
    });
}

fn take_read_failure(state: &mut PaperState) -> GatewayResult<()> {
    if state.fail_reads > 0 {
        state.fail_reads -= 1;
        return Err(GatewayError::Network("injected read failure".into()));
    }
    Ok(())
}

fn fill_market(
    state: &mut PaperState,
    symbol: &str,
    side: OrderSide,
    quantity: Decimal,
    reduce_only: bool,
    order_id: &str,
) -> GatewayResult<PaperFill> {
    let price = state
        .marks
        .get(symbol)
        .copied()
        .ok_or_else(|| GatewayError::InvalidRequest(format!("no mark price for {symbol}")))?;
    let mut realized = Decimal::ZERO;
    let mut filled = quantity;

    let existing = state
        .positions
        .get(symbol)
        .map(|p| (p.side, p.quantity, p.entry_price));
    match existing {
        Some((pos_side, pos_qty, entry)) if pos_side.exit_side() == side => {
            filled = quantity.min(pos_qty);
            realized = match pos_side {
                Side::Long => (price - entry) * filled,
                Side::Short => (entry - price) * filled,
            };
            let remaining = pos_qty - filled;
            if remaining <= Decimal::ZERO {
                state.positions.remove(symbol);
            } else if let Some(pos) = state.positions.get_mut(symbol) {
                pos.quantity = remaining;
            }
        }
        _ if reduce_only => {
            return Err(GatewayError::Rejected {
                reason: "ReduceOnly Order is rejected".into(),
            });
        }
        Some((pos_side, pos_qty, entry)) => {
            let total = pos_qty + quantity;
            state.positions.insert(
                symbol.to_string(),
                PaperPosition {
                    side: pos_side,
                    quantity: total,
                    entry_price: (entry * pos_qty + price * quantity) / total,
                },
            );
        }
        None => {
            let side = match side {
                OrderSide::Buy => Side::Long,
                OrderSide::Sell => Side::Short,
            };
            state.positions.insert(
                symbol.to_string(),
                PaperPosition {
                    side,
                    quantity,
                    entry_price: price,
                },
            );
        }
    }

    let fee = filled * price * state.fee_rate;
    state.balance += realized - fee;
    let fill = PaperFill {
        order_id: order_id.to_string(),
        symbol: symbol.to_string(),
        side,
        quantity: filled,
        price,
        realized_pnl: realized,
        fee,
        time: Utc::now(),
    };
    state.fills.push(fill.clone());
    Ok(fill)
}

#[async_trait]
impl ExchangeGateway for PaperGateway {
    async fn get_position(&self, symbol: &str) -> GatewayResult<PositionSnapshot> {
        let mut state = self.state.lock();
        take_read_failure(&mut state)?;
        Ok(match state.positions.get(symbol) {
            Some(p) => PositionSnapshot {
                symbol: symbol.to_string(),
                quantity: p.quantity,
                side: Some(p.side),
                entry_price: p.entry_price,
            },
            None => PositionSnapshot::flat(symbol),
        })
    }

    async fn get_open_orders(&self, symbol: &str) -> GatewayResult<Vec<Order>> {
        let mut state = self.state.lock();
        take_read_failure(&mut state)?;
        let mut visible = Vec::new();
        if let Some(resting) = state.orders.get_mut(symbol) {
            for r in resting.iter_mut() {
                if r.hidden_polls == 0 {
                    visible.push(r.order.clone());
                } else {
                    r.hidden_polls -= 1;
                }
            }
        }
        Ok(visible)
    }

    async fn place_order(&self, request: OrderRequest) -> GatewayResult<Order> {
        let mut state = self.state.lock();
        if state.fail_places > 0 {
            state.fail_places -= 1;
            return Err(GatewayError::Network("injected placement failure".into()));
        }
        if state.fail_closes > 0 && request.reduce_only && request.order_type == OrderType::Market {
            state.fail_closes -= 1;
            return Err(GatewayError::Network("injected close failure".into()));
        }
        if request.quantity <= Decimal::ZERO {
            return Err(GatewayError::InvalidRequest("quantity must be positive".into()));
        }
        let symbol = request.symbol.clone();
        let order_id = next_order_id(&mut state);

        let order = Order {
            order_id: order_id.clone(),
            symbol: symbol.clone(),
            order_type: request.order_type.as_str().to_string(),
            side: request.side,
            quantity: request.quantity,
            trigger_price: request.trigger_price,
            reduce_only: request.reduce_only,
            close_position: false,
        };

        match request.order_type {
            OrderType::Market => {
                fill_market(
                    &mut state,
                    &symbol,
                    request.side,
                    request.quantity,
                    request.reduce_only,
                    &order_id,
                )?;
                if !state.positions.contains_key(&symbol) {
                    // reduce-only orders die with the position
                    if let Some(resting) = state.orders.get_mut(&symbol) {
                        resting.retain(|r| !r.order.reduce_only);
                    }
                }
            }
            OrderType::StopMarket | OrderType::TakeProfitMarket => {
                let trigger = request
                    .trigger_price
                    .ok_or_else(|| GatewayError::InvalidRequest("trigger price required".into()))?;
                let mark = state.marks.get(&symbol).copied().unwrap_or(trigger);
                let immediate = match (request.order_type, request.side) {
                    (OrderType::StopMarket, OrderSide::Sell) => trigger >= mark,
                    (OrderType::StopMarket, OrderSide::Buy) => trigger <= mark,
                    (_, OrderSide::Sell) => trigger <= mark,
                    (_, OrderSide::Buy) => trigger >= mark,
                };
                if immediate {
                    return Err(GatewayError::Rejected {
                        reason: "Order would immediately trigger".into(),
                    });
                }
                let hidden_polls = state.hide_polls;
                state
                    .orders
                    .entry(symbol.clone())
                    .or_default()
                    .push(RestingOrder {
                        order: order.clone(),
                        hidden_polls,
                    });
            }
        }

        debug!(symbol = %symbol, order_id = %order_id, order_type = request.order_type.as_str(), "paper order placed");
        record_sample(&mut state, &symbol, "place_order");
        Ok(order)
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> GatewayResult<()> {
        let mut state = self.state.lock();
        if state.fail_cancels.contains(order_id) {
            return Err(GatewayError::Network("injected cancel failure".into()));
        }
        let resting = state.orders.entry(symbol.to_string()).or_default();
        let before = resting.len();
        resting.retain(|r| r.order.order_id != order_id);
        if resting.len() == before {
            return Err(GatewayError::NotFound {
                order_id: order_id.to_string(),
            });
        }
        record_sample(&mut state, symbol, "cancel_order");
        Ok(())
    }

    async fn get_balance(&self) -> GatewayResult<Decimal> {
        let mut state = self.state.lock();
        take_read_failure(&mut state)?;
        Ok(state.balance)
    }

    async fn get_mark_price(&self, symbol: &str) -> GatewayResult<Decimal> {
        let mut state = self.state.lock();
        take_read_failure(&mut state)?;
        state
            .marks
            .get(symbol)
            .copied()
            .ok_or_else(|| GatewayError::InvalidRequest(format!("unknown symbol {symbol}")))
    }

    async fn get_funding_rate(&self, symbol: &str) -> GatewayResult<Decimal> {
        Ok(self
            .state
            .lock()
            .funding
            .get(symbol)
            .copied()
            .unwrap_or(Decimal::ZERO))
    }

    async fn get_book_ticker(&self, symbol: &str) -> GatewayResult<BookTicker> {
        let state = self.state.lock();
        if let Some(ticker) = state.tickers.get(symbol) {
            return Ok(ticker.clone());
        }
        let mark = state
            .marks
            .get(symbol)
            .copied()
            .ok_or_else(|| GatewayError::InvalidRequest(format!("unknown symbol {symbol}")))?;
        let half_spread = mark * Decimal::new(1, 4);
        Ok(BookTicker {
            bid: mark - half_spread,
            ask: mark + half_spread,
            quote_volume_24h: Decimal::from(50_000_000),
        })
    }

    async fn get_instrument_rules(&self, symbol: &str) -> GatewayResult<InstrumentRules> {
        Ok(self
            .state
            .lock()
            .rules
            .get(symbol)
            .cloned()
            .unwrap_or_default())
    }
}
