//! Swap-price math: constant-product quotes, fee scaling, the minimum-price floor and the
//! display truncation applied to every published price.
//!
//! Everything here is pure. Network reads (reserves, quoter calls, transfer fees) happen in the
//! engine; these functions only turn their results into prices or "no price" (`None`).

use ethers::types::U256;

use crate::fee_oracle::TransferFees;
use crate::types::conversions::units_to_f64;
use crate::types::PoolPrices;

/// Prices below this are treated as unusable and the pool is dropped from the entry.
pub const MIN_PRICE: f64 = 5e-10;

/// Basis-point denominator used by the transfer-fee scaling.
pub const BPS_DENOMINATOR: u32 = 10_000;

const LP_FEE_NUMERATOR: u64 = 997;
const LP_FEE_DENOMINATOR: u64 = 1000;

// The sell side quotes a slightly larger reference amount to cover the 0.25% slippage margin.
const SELL_MARGIN_NUMERATOR: u64 = 10_000;
const SELL_MARGIN_DENOMINATOR: u64 = 9975;

/// Both directions of a quote, in human units of the token.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SwapPrices {
    /// Tokens received for the reference amount.
    pub eth_to_token: f64,
    /// Tokens needed to receive the (margin-adjusted) reference amount.
    pub token_to_eth: f64,
}

/// Reference amount quoted on the sell side: `amount * 10000 / 9975`.
pub fn sell_side_amount(amount: U256) -> U256 {
    amount.saturating_mul(U256::from(SELL_MARGIN_NUMERATOR)) / U256::from(SELL_MARGIN_DENOMINATOR)
}

/// Constant-product output for `amount_in`, including the 0.3% LP fee.
///
/// `floor(A*997*reserve_out / (reserve_in*1000 + A*997))`. `None` on overflow or an empty pool.
pub fn amount_out(amount_in: U256, reserve_in: U256, reserve_out: U256) -> Option<U256> {
    let with_fee = amount_in.checked_mul(U256::from(LP_FEE_NUMERATOR))?;
    let numerator = with_fee.checked_mul(reserve_out)?;
    let denominator = reserve_in
        .checked_mul(U256::from(LP_FEE_DENOMINATOR))?
        .checked_add(with_fee)?;
    if denominator.is_zero() {
        return None;
    }
    Some(numerator / denominator)
}

/// Constant-product input needed to take `amount_out` out of the pool, rounded up by one unit.
///
/// `None` when the pool cannot cover `amount_out` (`reserve_out <= amount_out`) or on overflow.
pub fn amount_in(amount_out: U256, reserve_in: U256, reserve_out: U256) -> Option<U256> {
    if reserve_out <= amount_out {
        return None;
    }
    let numerator = amount_out
        .checked_mul(U256::from(LP_FEE_DENOMINATOR))?
        .checked_mul(reserve_in)?;
    let denominator = (reserve_out - amount_out).checked_mul(U256::from(LP_FEE_NUMERATOR))?;
    (numerator / denominator).checked_add(U256::one())
}

/// Scales a raw buy quote down by the token's buy fee.
pub fn apply_buy_fee(raw: f64, fees: TransferFees) -> f64 {
    let denom = BPS_DENOMINATOR as f64;
    (raw / denom) * (denom - fees.buy_fee_bps as f64)
}

/// Scales a raw sell quote up by the token's sell fee. `None` for a fee of 100% or more.
pub fn apply_sell_fee(raw: f64, fees: TransferFees) -> Option<f64> {
    if fees.sell_fee_bps >= BPS_DENOMINATOR {
        return None;
    }
    let denom = BPS_DENOMINATOR as f64;
    Some((raw * denom) / (denom - fees.sell_fee_bps as f64))
}

fn above_floor(prices: SwapPrices) -> Option<SwapPrices> {
    let ok = |v: f64| v.is_finite() && v >= MIN_PRICE;
    if ok(prices.eth_to_token) && ok(prices.token_to_eth) {
        Some(prices)
    } else {
        None
    }
}

/// Prices a reserve-based pool for `amount` of the reference asset.
///
/// Reserves are `(reference, token)`. Returns `None` when the amount equals the token reserve,
/// when the reference reserve cannot cover the sell-side amount, or when either side falls
/// below [`MIN_PRICE`].
pub fn constant_product_prices(
    amount: U256,
    reserve_ref: U256,
    reserve_token: U256,
    token_decimals: u8,
    fees: TransferFees,
) -> Option<SwapPrices> {
    if amount == reserve_token {
        return None;
    }

    let bought = amount_out(amount, reserve_ref, reserve_token)?;
    let eth_to_token = apply_buy_fee(units_to_f64(bought, token_decimals).ok()?, fees);

    let needed = amount_in(sell_side_amount(amount), reserve_token, reserve_ref)?;
    let token_to_eth = apply_sell_fee(units_to_f64(needed, token_decimals).ok()?, fees)?;

    above_floor(SwapPrices {
        eth_to_token,
        token_to_eth,
    })
}

/// Prices a quoter-based pool from the raw exact-input and exact-output quotes.
///
/// A zero quote on either side means the quoter could not route the amount.
pub fn quoted_prices(
    quoted_out: U256,
    quoted_in: U256,
    token_decimals: u8,
    fees: TransferFees,
) -> Option<SwapPrices> {
    if quoted_out.is_zero() || quoted_in.is_zero() {
        return None;
    }
    let eth_to_token = apply_buy_fee(units_to_f64(quoted_out, token_decimals).ok()?, fees);
    let token_to_eth = apply_sell_fee(units_to_f64(quoted_in, token_decimals).ok()?, fees)?;
    above_floor(SwapPrices {
        eth_to_token,
        token_to_eth,
    })
}

/// Number-to-text the way a JavaScript engine prints it: shortest round-trip digits, plain
/// decimal notation between 1e-6 and 1e21, exponent notation (`1.5e-7`, `1e+21`) outside.
pub fn js_number_string(value: f64) -> String {
    if value.is_nan() {
        return "NaN".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if value == 0.0 {
        return "0".to_string();
    }
    let magnitude = value.abs();
    if (1e-6..1e21).contains(&magnitude) {
        return format!("{}", value);
    }
    let text = format!("{:e}", value);
    match text.split_once('e') {
        Some((mantissa, exp)) if !exp.starts_with('-') => format!("{}e+{}", mantissa, exp),
        _ => text,
    }
}

/// Truncates a price for display.
///
/// Above 99999 the integer part keeps its first six digits and the rest are zeroed; otherwise
/// the first seven characters of the number text are kept.
pub fn display_price(value: f64) -> String {
    let text = js_number_string(value);
    if value > 99_999.0 {
        let integer_part = text.split('.').next().unwrap_or(&text);
        if integer_part.len() >= 6 {
            let mut out = integer_part[..6].to_string();
            out.push_str(&"0".repeat(integer_part.len() - 6));
            return out;
        }
        return text;
    }
    text.chars().take(7).collect()
}

/// Display form of a pool's prices at the reference and adjustment amounts.
pub fn publish(base: SwapPrices, adjusted: SwapPrices, adjustment: U256) -> PoolPrices {
    PoolPrices {
        eth_to_token_price: display_price(base.eth_to_token),
        token_to_eth_price: display_price(base.token_to_eth),
        adjustment: adjustment.to_string(),
        eth_to_token_price_price_adjust: display_price(adjusted.eth_to_token),
        token_to_eth_price_price_adjust: display_price(adjusted.token_to_eth),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_FEES: TransferFees = TransferFees {
        buy_fee_bps: 0,
        sell_fee_bps: 0,
    };

    fn u(v: u64) -> U256 {
        U256::from(v)
    }

    #[test]
    fn test_amount_out_small_pool() {
        assert_eq!(amount_out(u(10), u(1000), u(1000)), Some(u(9)));
        assert_eq!(amount_out(u(0), u(0), u(1000)), None);
    }

    #[test]
    fn test_amount_in_rounds_up_and_rejects_drained_pool() {
        // 10*1000*1000 / (990*997) = 10.13.. -> 10, +1
        assert_eq!(amount_in(u(10), u(1000), u(1000)), Some(u(11)));
        assert_eq!(amount_in(u(1000), u(1000), u(1000)), None);
        assert_eq!(amount_in(u(2000), u(1000), u(1000)), None);
    }

    #[test]
    fn test_sell_side_amount() {
        assert_eq!(sell_side_amount(u(9975)), u(10_000));
        assert_eq!(sell_side_amount(u(1_000_000_000_000_000_000)), u(1_002_506_265_664_160_401));
    }

    #[test]
    fn test_fee_scaling() {
        let fees = TransferFees {
            buy_fee_bps: 25,
            sell_fee_bps: 500,
        };
        assert!((apply_buy_fee(100.0, fees) - 99.75).abs() < 1e-9);
        let sell = apply_sell_fee(95.0, fees).unwrap();
        assert!((sell - 100.0).abs() < 1e-9);
        let all = TransferFees {
            buy_fee_bps: 0,
            sell_fee_bps: 10_000,
        };
        assert_eq!(apply_sell_fee(1.0, all), None);
    }

    #[test]
    fn test_constant_product_prices_balanced_pool() {
        let one = u(1_000_000_000_000_000_000);
        let reserve = one * u(1000);
        let p = constant_product_prices(one, reserve, reserve, 18, NO_FEES).unwrap();
        assert!(p.eth_to_token > 0.99 && p.eth_to_token < 1.0);
        assert!(p.token_to_eth > 1.0 && p.token_to_eth < 1.01);
    }

    #[test]
    fn test_amount_equal_to_token_reserve_is_no_price() {
        assert_eq!(
            constant_product_prices(u(500), u(10_000), u(500), 0, NO_FEES),
            None
        );
    }

    #[test]
    fn test_reference_reserve_too_small_is_no_price() {
        assert_eq!(
            constant_product_prices(u(1000), u(1000), u(1_000_000), 0, NO_FEES),
            None
        );
    }

    #[test]
    fn test_tiny_price_is_suppressed() {
        // buying with 1 unit against a 1e12:2 pool yields ~2e-12 tokens
        let one = u(1_000_000_000_000_000_000);
        let p = constant_product_prices(one, one * u(1_000_000_000_000u64), one * u(2), 18, NO_FEES);
        assert_eq!(p, None);
        assert_eq!(quoted_prices(u(1), u(1), 18, NO_FEES), None);
    }

    #[test]
    fn test_quoted_prices() {
        assert_eq!(quoted_prices(U256::zero(), u(5), 0, NO_FEES), None);
        let p = quoted_prices(u(2_000_000), u(2_100_000), 6, NO_FEES).unwrap();
        assert!((p.eth_to_token - 2.0).abs() < 1e-12);
        assert!((p.token_to_eth - 2.1).abs() < 1e-12);
    }

    #[test]
    fn test_js_number_string() {
        assert_eq!(js_number_string(42.12345), "42.12345");
        assert_eq!(js_number_string(1.0), "1");
        assert_eq!(js_number_string(0.000001), "0.000001");
        assert_eq!(js_number_string(1.5e-7), "1.5e-7");
        assert_eq!(js_number_string(1e21), "1e+21");
        assert_eq!(js_number_string(1.25e22), "1.25e+22");
    }

    #[test]
    fn test_display_price() {
        assert_eq!(display_price(123456.789), "123456");
        assert_eq!(display_price(1234567.89), "1234560");
        assert_eq!(display_price(42.12345), "42.1234");
        assert_eq!(display_price(0.000123456789), "0.00012");
        assert_eq!(display_price(99999.5), "99999.5");
        assert_eq!(display_price(2.5e-7), "2.5e-7");
        assert_eq!(display_price(1.25e22), "1.25e+22");
    }
}
