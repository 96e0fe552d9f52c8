use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::errors::{ExchangeError, ExchangeResult};
use crate::money::Cents;
use crate::orders::{SymbolId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Manager,
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub role: Role,
    pub cash: Cents,
}

/// Authoritative cash and position state (the ledger).
///
/// The coordinator composes these operations inside a per-symbol critical
/// section; on their own they only guarantee that a single call is atomic
/// (`reserve_cash` never leaves a balance below zero).
///
/// Position rows are kept only while non-zero: `adjust_position` deletes a
/// row the moment it settles back to zero.
#[derive(Debug, Default)]
pub struct Accounts {
    users: HashMap<UserId, User>,
    positions: HashMap<(UserId, SymbolId), i64>,
}

impl Accounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_user(&mut self, id: UserId, username: String, role: Role, cash: Cents) {
        debug!(id, username = %username, ?role, "account created");
        self.users.insert(
            id,
            User {
                id,
                username,
                role,
                cash,
            },
        );
    }

    pub fn user(&self, id: UserId) -> ExchangeResult<&User> {
        self.users.get(&id).ok_or(ExchangeError::UnknownUser)
    }

    pub fn username_taken(&self, username: &str) -> bool {
        self.users.values().any(|u| u.username == username)
    }

    pub fn manager_count(&self) -> usize {
        self.users
            .values()
            .filter(|u| u.role == Role::Manager)
            .count()
    }

    /// Remove the account and every position row it owns.
    pub fn remove_user(&mut self, id: UserId) {
        self.users.remove(&id);
        self.positions.retain(|(user, _), _| *user != id);
    }

    /// Atomically verify `balance >= amount` and deduct.
    pub fn reserve_cash(&mut self, user: UserId, amount: Cents) -> ExchangeResult<()> {
        let u = self.users.get_mut(&user).ok_or(ExchangeError::UnknownUser)?;
        if u.cash < amount {
            return Err(ExchangeError::InsufficientFunds);
        }
        u.cash -= amount;
        Ok(())
    }

    pub fn credit_cash(&mut self, user: UserId, amount: Cents) -> ExchangeResult<()> {
        let u = self.users.get_mut(&user).ok_or(ExchangeError::UnknownUser)?;
        u.cash = u
            .cash
            .checked_add(amount)
            .ok_or_else(|| ExchangeError::internal("cash balance overflow"))?;
        Ok(())
    }

    /// Unconditional debit. Callers must have established that the balance
    /// covers `amount`; an underflow here is an invariant failure.
    pub fn debit_cash(&mut self, user: UserId, amount: Cents) -> ExchangeResult<()> {
        let u = self.users.get_mut(&user).ok_or(ExchangeError::UnknownUser)?;
        u.cash = u
            .cash
            .checked_sub(amount)
            .ok_or_else(|| ExchangeError::internal("cash balance underflow"))?;
        Ok(())
    }

    /// Signed addition to a position; creates the row if absent and deletes
    /// it when the result is zero. Returns the resulting quantity.
    pub fn adjust_position(
        &mut self,
        user: UserId,
        symbol: SymbolId,
        delta: i64,
    ) -> ExchangeResult<i64> {
        let entry = self.positions.entry((user, symbol)).or_insert(0);
        *entry = entry
            .checked_add(delta)
            .ok_or_else(|| ExchangeError::internal("position overflow"))?;
        let quantity = *entry;
        if quantity == 0 {
            self.positions.remove(&(user, symbol));
        }
        Ok(quantity)
    }

    pub fn get_position(&self, user: UserId, symbol: SymbolId) -> i64 {
        self.positions.get(&(user, symbol)).copied().unwrap_or(0)
    }

    pub fn positions_of(&self, user: UserId) -> Vec<(SymbolId, i64)> {
        let mut rows: Vec<(SymbolId, i64)> = self
            .positions
            .iter()
            .filter(|((u, _), _)| *u == user)
            .map(|((_, symbol), qty)| (*symbol, *qty))
            .collect();
        rows.sort_by_key(|(symbol, _)| *symbol);
        rows
    }

    /// True while any account holds a non-zero position in the symbol.
    /// Rows are non-zero by construction, so presence is enough.
    pub fn symbol_in_use(&self, symbol: SymbolId) -> bool {
        self.positions.keys().any(|(_, s)| *s == symbol)
    }

    /// Signed sum over all positions in the symbol.
    pub fn position_sum(&self, symbol: SymbolId) -> i64 {
        self.positions
            .iter()
            .filter(|((_, s), _)| *s == symbol)
            .map(|(_, qty)| qty)
            .sum()
    }
}
