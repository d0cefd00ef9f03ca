use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::engine::AccountView;

/// Durable balance row, projected from `balance_changed` post-state events
/// and read back verbatim on engine recovery.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserBalance {
    pub user_id: i64,
    pub mint_address: String,
    pub available: Decimal,
    pub locked: Decimal,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl UserBalance {
    pub fn total(&self) -> Decimal {
        self.available + self.locked
    }

    pub fn to_view(&self) -> AccountView {
        AccountView {
            user_id: self.user_id,
            asset: self.mint_address.clone(),
            available: self.available,
            locked: self.locked,
            version: self.version.max(0) as u64,
        }
    }
}
