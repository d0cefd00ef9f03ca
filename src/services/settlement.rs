//! Daily Settlement Boundary
//!
//! Input contract for the daily settlement pipeline: it consumes the trade
//! stream plus opening/closing balance snapshots and folds them into
//! per-user per-asset daily aggregates. A double-entry validator asserts
//! that intra-exchange trading nets to zero per asset and that the day's
//! balance drift equals the external boundary movements (deposits,
//! withdrawals, sync adjustments). The batch pipeline consuming the report
//! lives elsewhere.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::BTreeMap;

use crate::events::{BalanceChangeReason, BalanceChangedPayload, TradeExecutedPayload};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SettlementError {
    #[error("asset {asset} trades do not net to zero (difference {difference})")]
    TradeImbalance { asset: String, difference: Decimal },

    #[error("asset {asset} balance drift {drift} does not match external net {external}")]
    ExternalMismatch {
        asset: String,
        drift: Decimal,
        external: Decimal,
    },
}

/// One user's daily activity in one asset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserAssetAggregate {
    /// Received through trades.
    pub traded_in: Decimal,
    /// Paid out through trades.
    pub traded_out: Decimal,
    /// Net external movement (deposits positive, withdrawals negative).
    pub external_net: Decimal,
    /// `available + locked` at day open / close, when snapshotted.
    pub opening: Option<Decimal>,
    pub closing: Option<Decimal>,
}

/// Validated daily report.
#[derive(Debug, Clone)]
pub struct DailySettlementReport {
    pub day: NaiveDate,
    pub rows: BTreeMap<(i64, String), UserAssetAggregate>,
    /// Per-asset net external movement for the day.
    pub external_totals: BTreeMap<String, Decimal>,
}

/// Accumulates one day of trade and balance inputs.
pub struct DailyAggregator {
    day: NaiveDate,
    rows: BTreeMap<(i64, String), UserAssetAggregate>,
}

impl DailyAggregator {
    pub fn new(day: NaiveDate) -> Self {
        Self {
            day,
            rows: BTreeMap::new(),
        }
    }

    fn row(&mut self, user_id: i64, asset: &str) -> &mut UserAssetAggregate {
        self.rows
            .entry((user_id, asset.to_string()))
            .or_default()
    }

    /// Opening `available + locked` snapshot for one account.
    pub fn open_snapshot(&mut self, user_id: i64, asset: &str, total: Decimal) {
        self.row(user_id, asset).opening = Some(total);
    }

    /// Closing `available + locked` snapshot for one account.
    pub fn close_snapshot(&mut self, user_id: i64, asset: &str, total: Decimal) {
        self.row(user_id, asset).closing = Some(total);
    }

    /// Fold one trade: the buyer receives base and pays quote, the seller
    /// the reverse.
    pub fn ingest_trade(&mut self, trade: &TradeExecutedPayload) {
        let quote_value = crate::engine::decimal::mul(trade.price, trade.amount);
        let base = trade.pair.base.clone();
        let quote = trade.pair.quote.clone();

        self.row(trade.buyer_id, &base).traded_in += trade.amount;
        self.row(trade.buyer_id, &quote).traded_out += quote_value;
        self.row(trade.seller_id, &base).traded_out += trade.amount;
        self.row(trade.seller_id, &quote).traded_in += quote_value;
    }

    /// Fold an external boundary movement. Lock/unlock/settlement events
    /// reshuffle within the exchange and are ignored here.
    pub fn ingest_balance_event(&mut self, event: &BalanceChangedPayload) {
        let external = matches!(
            event.reason,
            BalanceChangeReason::Deposit | BalanceChangeReason::Withdraw | BalanceChangeReason::Sync
        );
        if !external {
            return;
        }
        if let Some(delta) = event.delta {
            self.row(event.user_id, &event.asset).external_net += delta;
        }
    }

    /// Validate double-entry and produce the report.
    ///
    /// Per asset: trade legs must net to zero across users, and where every
    /// row carries both snapshots, total drift must equal the external net.
    pub fn build(self) -> Result<DailySettlementReport, SettlementError> {
        let mut trade_net: BTreeMap<String, Decimal> = BTreeMap::new();
        let mut external_totals: BTreeMap<String, Decimal> = BTreeMap::new();
        let mut drift: BTreeMap<String, (Decimal, bool)> = BTreeMap::new();

        for ((_, asset), row) in &self.rows {
            *trade_net.entry(asset.clone()).or_default() += row.traded_in - row.traded_out;
            *external_totals.entry(asset.clone()).or_default() += row.external_net;

            let entry = drift.entry(asset.clone()).or_insert((Decimal::ZERO, true));
            match (row.opening, row.closing) {
                (Some(open), Some(close)) => entry.0 += close - open,
                // a row without both snapshots leaves drift unverifiable
                _ => entry.1 = false,
            }
        }

        for (asset, net) in &trade_net {
            if !net.is_zero() {
                return Err(SettlementError::TradeImbalance {
                    asset: asset.clone(),
                    difference: *net,
                });
            }
        }

        for (asset, (total_drift, complete)) in &drift {
            if !complete {
                continue;
            }
            let external = external_totals
                .get(asset)
                .copied()
                .unwrap_or(Decimal::ZERO);
            if *total_drift != external {
                return Err(SettlementError::ExternalMismatch {
                    asset: asset.clone(),
                    drift: *total_drift,
                    external,
                });
            }
        }

        Ok(DailySettlementReport {
            day: self.day,
            rows: self.rows,
            external_totals,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::TradingPair;
    use rust_decimal_macros::dec;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    fn trade(buyer: i64, seller: i64, price: Decimal, amount: Decimal) -> TradeExecutedPayload {
        TradeExecutedPayload {
            trade_id: 1,
            buy_order_id: 1,
            sell_order_id: 2,
            buyer_id: buyer,
            seller_id: seller,
            pair: TradingPair::new("SOL", "USDT"),
            price,
            amount,
            created_at: 0,
        }
    }

    fn deposit(user_id: i64, asset: &str, amount: Decimal) -> BalanceChangedPayload {
        BalanceChangedPayload {
            user_id,
            asset: asset.to_string(),
            available: amount,
            locked: Decimal::ZERO,
            version: 1,
            reason: BalanceChangeReason::Deposit,
            delta: Some(amount),
            created_at: 0,
        }
    }

    #[test]
    fn test_trades_always_net_to_zero() {
        let mut agg = DailyAggregator::new(day());
        agg.ingest_trade(&trade(1, 2, dec!(100), dec!(3)));
        agg.ingest_trade(&trade(2, 1, dec!(110), dec!(1)));

        let report = agg.build().unwrap();
        let buyer_base = &report.rows[&(1, "SOL".to_string())];
        assert_eq!(buyer_base.traded_in, dec!(3));
        assert_eq!(buyer_base.traded_out, dec!(1));
    }

    #[test]
    fn test_drift_reconciles_against_deposits() {
        let mut agg = DailyAggregator::new(day());
        agg.open_snapshot(1, "USDT", dec!(0));
        agg.open_snapshot(2, "USDT", dec!(500));
        agg.ingest_balance_event(&deposit(1, "USDT", dec!(1000)));
        // trading moves 300 USDT from 1 to 2, no external effect
        agg.ingest_trade(&trade(1, 2, dec!(100), dec!(3)));
        agg.open_snapshot(1, "SOL", dec!(0));
        agg.open_snapshot(2, "SOL", dec!(3));
        agg.close_snapshot(1, "USDT", dec!(700));
        agg.close_snapshot(2, "USDT", dec!(800));
        agg.close_snapshot(1, "SOL", dec!(3));
        agg.close_snapshot(2, "SOL", dec!(0));

        let report = agg.build().unwrap();
        assert_eq!(report.external_totals["USDT"], dec!(1000));
        assert_eq!(
            report.external_totals.get("SOL").copied().unwrap_or_default(),
            dec!(0)
        );
    }

    #[test]
    fn test_unexplained_drift_fails_validation() {
        let mut agg = DailyAggregator::new(day());
        agg.open_snapshot(1, "USDT", dec!(100));
        agg.close_snapshot(1, "USDT", dec!(150)); // 50 appeared from nowhere

        let err = agg.build().unwrap_err();
        assert!(matches!(err, SettlementError::ExternalMismatch { .. }));
    }

    #[test]
    fn test_missing_snapshot_skips_drift_check() {
        let mut agg = DailyAggregator::new(day());
        agg.close_snapshot(1, "USDT", dec!(150)); // no opening snapshot
        assert!(agg.build().is_ok());
    }

    #[test]
    fn test_internal_moves_are_not_external() {
        let mut agg = DailyAggregator::new(day());
        let mut event = deposit(1, "USDT", dec!(100));
        event.reason = BalanceChangeReason::TradeSettlement;
        agg.ingest_balance_event(&event);

        let report = agg.build().unwrap();
        assert!(report
            .external_totals
            .get("USDT")
            .map_or(true, Decimal::is_zero));
    }
}
