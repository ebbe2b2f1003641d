use anyhow::Result;
use rust_decimal::Decimal;

/// Quantity that loses `equity × risk_pct × position_scale` if the stop is hit.
///
/// The resulting notional is capped at `equity × leverage_cap`; the cap only ever
/// shrinks the size.
///
/// # Arguments
/// * `equity` - Account equity in quote currency
/// * `entry_price` - Expected entry price
/// * `stop_price` - Initial protective stop
/// * `risk_pct` - Fraction of equity risked at full scale (0.0035 = 0.35%)
/// * `position_scale` - Regime/gate scale in (0, 1]
/// * `leverage_cap` - Maximum notional as a multiple of equity
///
/// # Errors
/// Returns error if any input is non-positive or the stop equals the entry.
pub fn risk_based_quantity(
    equity: Decimal,
    entry_price: Decimal,
    stop_price: Decimal,
    risk_pct: Decimal,
    position_scale: Decimal,
    leverage_cap: u32,
) -> Result<Decimal> {
    if equity <= Decimal::ZERO {
        anyhow::bail!("Equity must be positive");
    }
    if entry_price <= Decimal::ZERO || stop_price <= Decimal::ZERO {
        anyhow::bail!("Entry and stop prices must be positive");
    }
    if risk_pct <= Decimal::ZERO || position_scale <= Decimal::ZERO {
        anyhow::bail!("Risk and scale must be positive");
    }
    if leverage_cap == 0 {
        anyhow::bail!("Leverage cap must be at least 1");
    }

    let stop_distance_pct = (entry_price - stop_price).abs() / entry_price;
    if stop_distance_pct.is_zero() {
        anyhow::bail!("Stop price must differ from entry price");
    }

    let risk_amount = equity * risk_pct * position_scale;
    let notional = (risk_amount / stop_distance_pct).min(equity * Decimal::from(leverage_cap));

    Ok(notional / entry_price)
}

/// Leverage implied by a position's notional.
#[must_use]
pub fn effective_leverage(notional: Decimal, equity: Decimal) -> Decimal {
    if equity <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    notional / equity
}
