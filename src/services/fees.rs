//! Fee Calculator
//!
//! In-memory fee-config cache, loaded once at startup. Rate lookup
//! precedence: exact (base, quote) match, then base-only, then quote-only,
//! then the default of 1 bp on both sides. Fees are computed on the trade's
//! quote value and are quote-denominated for buyer and seller alike.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::engine::decimal;
use crate::engine::types::TradingPair;

/// Which side of the trade pays this fee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "fee_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FeeType {
    Buyer,
    Seller,
}

/// One configured fee rule. `base`/`quote` of `None` act as wildcards.
#[derive(Debug, Clone, Deserialize)]
pub struct FeeRule {
    pub base: Option<String>,
    pub quote: Option<String>,
    pub buyer_rate: Decimal,
    pub seller_rate: Decimal,
}

/// A resolved fee: the rate applied and the resulting amount.
#[derive(Debug, Clone, PartialEq)]
pub struct FeeAmount {
    pub rate: Decimal,
    pub amount: Decimal,
}

type RatePair = (Decimal, Decimal);

/// Startup-loaded rate cache.
pub struct FeeCalculator {
    exact: HashMap<(String, String), RatePair>,
    by_base: HashMap<String, RatePair>,
    by_quote: HashMap<String, RatePair>,
    default_rates: RatePair,
}

impl FeeCalculator {
    /// Default fee when no rows are configured: 1 bp on both sides.
    pub fn default_rate() -> Decimal {
        Decimal::new(1, 4)
    }

    pub fn new(rules: Vec<FeeRule>) -> Self {
        let mut calc = Self {
            exact: HashMap::new(),
            by_base: HashMap::new(),
            by_quote: HashMap::new(),
            default_rates: (Self::default_rate(), Self::default_rate()),
        };
        for rule in rules {
            let rates = (rule.buyer_rate, rule.seller_rate);
            match (rule.base, rule.quote) {
                (Some(base), Some(quote)) => {
                    calc.exact.insert((base, quote), rates);
                }
                (Some(base), None) => {
                    calc.by_base.insert(base, rates);
                }
                (None, Some(quote)) => {
                    calc.by_quote.insert(quote, rates);
                }
                (None, None) => {
                    calc.default_rates = rates;
                }
            }
        }
        calc
    }

    /// Applicable rate for one side of a trade on `pair`.
    pub fn rate_for(&self, pair: &TradingPair, fee_type: FeeType) -> Decimal {
        let rates = self
            .exact
            .get(&(pair.base.clone(), pair.quote.clone()))
            .or_else(|| self.by_base.get(&pair.base))
            .or_else(|| self.by_quote.get(&pair.quote))
            .unwrap_or(&self.default_rates);
        match fee_type {
            FeeType::Buyer => rates.0,
            FeeType::Seller => rates.1,
        }
    }

    /// `fee_amount = trade_value * fee_rate`, renormalized half-up.
    pub fn fee_for(&self, pair: &TradingPair, fee_type: FeeType, trade_value: Decimal) -> FeeAmount {
        let rate = self.rate_for(pair, fee_type);
        FeeAmount {
            rate,
            amount: decimal::mul(trade_value, rate),
        }
    }
}

impl Default for FeeCalculator {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}
