//! Balance Store
//!
//! Per-(user, asset) accounts with an available/locked split. The store is
//! the only resource shared across pair loops, so each account sits behind
//! its own mutex; two-account operations take both locks in canonical key
//! order. Every mutation bumps a per-account version and returns the
//! post-state view, which downstream projections use as an idempotence and
//! ordering key.

use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::Arc;

use super::decimal;
use super::error::BalanceError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct BalanceKey {
    user_id: i64,
    asset: String,
}

#[derive(Debug, Default)]
struct Account {
    available: Decimal,
    locked: Decimal,
    version: u64,
}

/// Post-state view of one account after a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountView {
    pub user_id: i64,
    pub asset: String,
    pub available: Decimal,
    pub locked: Decimal,
    pub version: u64,
}

/// Global balance store shared by all pair loops.
#[derive(Default)]
pub struct BalanceStore {
    accounts: DashMap<BalanceKey, Arc<Mutex<Account>>>,
}

impl BalanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn account(&self, user_id: i64, asset: &str) -> Arc<Mutex<Account>> {
        let key = BalanceKey {
            user_id,
            asset: asset.to_string(),
        };
        self.accounts
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(Account::default())))
            .clone()
    }

    fn view(user_id: i64, asset: &str, account: &mut Account) -> AccountView {
        account.version += 1;
        AccountView {
            user_id,
            asset: asset.to_string(),
            available: account.available,
            locked: account.locked,
            version: account.version,
        }
    }

    /// `available += amount`. External boundary movement (deposit).
    pub fn credit_available(
        &self,
        user_id: i64,
        asset: &str,
        amount: Decimal,
    ) -> Result<AccountView, BalanceError> {
        if amount < Decimal::ZERO {
            return Err(BalanceError::NegativeAmount);
        }
        let handle = self.account(user_id, asset);
        let mut account = handle.lock();
        account.available += amount;
        Ok(Self::view(user_id, asset, &mut account))
    }

    /// `available -= amount`. External boundary movement (withdrawal).
    pub fn debit_available(
        &self,
        user_id: i64,
        asset: &str,
        amount: Decimal,
    ) -> Result<AccountView, BalanceError> {
        if amount < Decimal::ZERO {
            return Err(BalanceError::NegativeAmount);
        }
        let handle = self.account(user_id, asset);
        let mut account = handle.lock();
        if !decimal::is_non_negative_after_epsilon(account.available, amount) {
            return Err(BalanceError::InsufficientAvailable {
                user_id,
                asset: asset.to_string(),
            });
        }
        account.available = (account.available - amount).max(Decimal::ZERO);
        Ok(Self::view(user_id, asset, &mut account))
    }

    /// Atomic `available -= amount; locked += amount`.
    pub fn lock(
        &self,
        user_id: i64,
        asset: &str,
        amount: Decimal,
    ) -> Result<AccountView, BalanceError> {
        if amount < Decimal::ZERO {
            return Err(BalanceError::NegativeAmount);
        }
        let handle = self.account(user_id, asset);
        let mut account = handle.lock();
        if !decimal::is_non_negative_after_epsilon(account.available, amount) {
            return Err(BalanceError::InsufficientAvailable {
                user_id,
                asset: asset.to_string(),
            });
        }
        account.available = (account.available - amount).max(Decimal::ZERO);
        account.locked += amount;
        Ok(Self::view(user_id, asset, &mut account))
    }

    /// Atomic `locked -= amount; available += amount`.
    pub fn unlock(
        &self,
        user_id: i64,
        asset: &str,
        amount: Decimal,
    ) -> Result<AccountView, BalanceError> {
        if amount < Decimal::ZERO {
            return Err(BalanceError::NegativeAmount);
        }
        let handle = self.account(user_id, asset);
        let mut account = handle.lock();
        if !decimal::is_non_negative_after_epsilon(account.locked, amount) {
            return Err(BalanceError::InsufficientLocked {
                user_id,
                asset: asset.to_string(),
            });
        }
        account.locked = (account.locked - amount).max(Decimal::ZERO);
        account.available += amount;
        Ok(Self::view(user_id, asset, &mut account))
    }

    /// Atomic `from.locked -= amount; to.available += amount`.
    ///
    /// Both account locks are taken in ascending (user, asset) key order so
    /// concurrent transfers cannot deadlock.
    pub fn transfer_locked(
        &self,
        from_user: i64,
        to_user: i64,
        asset: &str,
        amount: Decimal,
    ) -> Result<(AccountView, AccountView), BalanceError> {
        if amount < Decimal::ZERO {
            return Err(BalanceError::NegativeAmount);
        }
        if from_user == to_user {
            // Self-transfer degenerates to an unlock on a single account.
            let view = self.unlock(from_user, asset, amount)?;
            return Ok((view.clone(), view));
        }

        let from_handle = self.account(from_user, asset);
        let to_handle = self.account(to_user, asset);

        let (mut first, mut second) = if from_user < to_user {
            (from_handle.lock(), to_handle.lock())
        } else {
            (to_handle.lock(), from_handle.lock())
        };
        let (from_account, to_account) = if from_user < to_user {
            (&mut *first, &mut *second)
        } else {
            (&mut *second, &mut *first)
        };

        if !decimal::is_non_negative_after_epsilon(from_account.locked, amount) {
            return Err(BalanceError::InsufficientLocked {
                user_id: from_user,
                asset: asset.to_string(),
            });
        }
        from_account.locked = (from_account.locked - amount).max(Decimal::ZERO);
        to_account.available += amount;

        Ok((
            Self::view(from_user, asset, from_account),
            Self::view(to_user, asset, to_account),
        ))
    }

    /// Apply an externally computed delta to `available`. Negative deltas
    /// that would drive the balance below zero are a hard error.
    pub fn apply_available_delta(
        &self,
        user_id: i64,
        asset: &str,
        delta: Decimal,
    ) -> Result<AccountView, BalanceError> {
        let handle = self.account(user_id, asset);
        let mut account = handle.lock();
        let next = account.available + delta;
        if next < Decimal::ZERO {
            return Err(BalanceError::InsufficientAvailable {
                user_id,
                asset: asset.to_string(),
            });
        }
        account.available = next;
        Ok(Self::view(user_id, asset, &mut account))
    }

    /// Administrative overwrite, used by bootstrap replay and tests only.
    pub fn set(
        &self,
        user_id: i64,
        asset: &str,
        available: Decimal,
        locked: Decimal,
    ) -> AccountView {
        let handle = self.account(user_id, asset);
        let mut account = handle.lock();
        account.available = available;
        account.locked = locked;
        Self::view(user_id, asset, &mut account)
    }

    /// Read-only copy of one account without bumping the version.
    pub fn get(&self, user_id: i64, asset: &str) -> AccountView {
        let handle = self.account(user_id, asset);
        let account = handle.lock();
        AccountView {
            user_id,
            asset: asset.to_string(),
            available: account.available,
            locked: account.locked,
            version: account.version,
        }
    }

    /// Read-only copy of every account for one user.
    pub fn snapshot_user(&self, user_id: i64) -> Vec<AccountView> {
        let mut out = Vec::new();
        for entry in self.accounts.iter() {
            if entry.key().user_id != user_id {
                continue;
            }
            let account = entry.value().lock();
            out.push(AccountView {
                user_id,
                asset: entry.key().asset.clone(),
                available: account.available,
                locked: account.locked,
                version: account.version,
            });
        }
        out.sort_by(|a, b| a.asset.cmp(&b.asset));
        out
    }

    /// Read-only copy of every account.
    pub fn snapshot_all(&self) -> Vec<AccountView> {
        let mut out = Vec::new();
        for entry in self.accounts.iter() {
            let account = entry.value().lock();
            out.push(AccountView {
                user_id: entry.key().user_id,
                asset: entry.key().asset.clone(),
                available: account.available,
                locked: account.locked,
                version: account.version,
            });
        }
        out.sort_by(|a, b| (a.user_id, &a.asset).cmp(&(b.user_id, &b.asset)));
        out
    }

    /// Sum of `available + locked` over all users for one asset.
    pub fn total_supply(&self, asset: &str) -> Decimal {
        let mut total = Decimal::ZERO;
        for entry in self.accounts.iter() {
            if entry.key().asset != asset {
                continue;
            }
            let account = entry.value().lock();
            total += account.available + account.locked;
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_credit_debit_roundtrip() {
        let store = BalanceStore::new();
        let view = store.credit_available(1, "USDT", dec!(100)).unwrap();
        assert_eq!(view.available, dec!(100));
        assert_eq!(view.locked, dec!(0));

        let view = store.debit_available(1, "USDT", dec!(40)).unwrap();
        assert_eq!(view.available, dec!(60));
    }

    #[test]
    fn test_debit_insufficient() {
        let store = BalanceStore::new();
        store.credit_available(1, "USDT", dec!(10)).unwrap();
        let err = store.debit_available(1, "USDT", dec!(11)).unwrap_err();
        assert!(matches!(err, BalanceError::InsufficientAvailable { .. }));
        assert_eq!(store.get(1, "USDT").available, dec!(10));
    }

    #[test]
    fn test_lock_unlock() {
        let store = BalanceStore::new();
        store.credit_available(1, "USDT", dec!(100)).unwrap();

        let view = store.lock(1, "USDT", dec!(70)).unwrap();
        assert_eq!(view.available, dec!(30));
        assert_eq!(view.locked, dec!(70));

        let view = store.unlock(1, "USDT", dec!(70)).unwrap();
        assert_eq!(view.available, dec!(100));
        assert_eq!(view.locked, dec!(0));

        assert!(matches!(
            store.unlock(1, "USDT", dec!(1)),
            Err(BalanceError::InsufficientLocked { .. })
        ));
    }

    #[test]
    fn test_lock_tolerates_epsilon_and_clamps() {
        let store = BalanceStore::new();
        store
            .credit_available(1, "USDT", dec!(9.999999999999999999))
            .unwrap();
        // one ulp short is tolerated, and the result clamps at zero
        let view = store.lock(1, "USDT", dec!(10)).unwrap();
        assert_eq!(view.available, dec!(0));
        assert_eq!(view.locked, dec!(10));
    }

    #[test]
    fn test_transfer_locked_conserves_supply() {
        let store = BalanceStore::new();
        store.credit_available(1, "USDT", dec!(100)).unwrap();
        store.lock(1, "USDT", dec!(100)).unwrap();

        let (from, to) = store.transfer_locked(1, 2, "USDT", dec!(60)).unwrap();
        assert_eq!(from.locked, dec!(40));
        assert_eq!(to.available, dec!(60));
        assert_eq!(store.total_supply("USDT"), dec!(100));
    }

    #[test]
    fn test_transfer_locked_insufficient_is_error() {
        let store = BalanceStore::new();
        store.credit_available(1, "USDT", dec!(10)).unwrap();
        store.lock(1, "USDT", dec!(10)).unwrap();
        assert!(matches!(
            store.transfer_locked(1, 2, "USDT", dec!(11)),
            Err(BalanceError::InsufficientLocked { .. })
        ));
    }

    #[test]
    fn test_sync_delta_hard_floor() {
        let store = BalanceStore::new();
        store.credit_available(1, "USDT", dec!(5)).unwrap();
        store.apply_available_delta(1, "USDT", dec!(-5)).unwrap();
        assert_eq!(store.get(1, "USDT").available, dec!(0));
        assert!(matches!(
            store.apply_available_delta(1, "USDT", dec!(-0.000000000000000001)),
            Err(BalanceError::InsufficientAvailable { .. })
        ));
    }

    #[test]
    fn test_versions_are_monotonic() {
        let store = BalanceStore::new();
        let v1 = store.credit_available(1, "USDT", dec!(1)).unwrap();
        let v2 = store.credit_available(1, "USDT", dec!(1)).unwrap();
        assert!(v2.version > v1.version);
    }
}
