use crate::utils::round_cents;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;

/// Per-asset lot sequence number, starting at 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LotId(pub u64);

impl fmt::Display for LotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of transaction that opened a lot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LotOrigin {
    Acquisition,
    TransferIn,
    Reward,
}

impl LotOrigin {
    pub fn display(&self) -> &'static str {
        match self {
            LotOrigin::Acquisition => "Acquisition",
            LotOrigin::TransferIn => "Transfer In",
            LotOrigin::Reward => "Reward",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LotState {
    Open,
    PartiallyConsumed,
    Closed,
}

impl LotState {
    pub fn display(&self) -> &'static str {
        match self {
            LotState::Open => "Open",
            LotState::PartiallyConsumed => "Partial",
            LotState::Closed => "Closed",
        }
    }
}

/// A discrete acquisition tracked for cost basis and holding period
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lot {
    pub id: LotId,
    pub asset: String,
    pub acquired_at: DateTime<Utc>,
    pub original_quantity: Decimal,
    pub remaining_quantity: Decimal,
    /// Acquisition cost per unit including the fee, for display
    pub unit_cost_eur: Decimal,
    /// Exact acquisition cost of the whole lot including the fee
    pub cost_eur: Decimal,
    /// Part of `cost_eur` still attached to the remaining quantity
    pub remaining_cost_eur: Decimal,
    pub origin_transaction_id: String,
    pub origin: LotOrigin,
}

impl Lot {
    pub fn state(&self) -> LotState {
        if self.remaining_quantity.is_zero() {
            LotState::Closed
        } else if self.remaining_quantity < self.original_quantity {
            LotState::PartiallyConsumed
        } else {
            LotState::Open
        }
    }

    pub fn is_open(&self) -> bool {
        self.remaining_quantity > Decimal::ZERO
    }

    /// Cost basis of the remaining quantity
    pub fn cost_basis_eur(&self) -> Decimal {
        self.remaining_cost_eur
    }

    /// Cost carried by `quantity` taken out of the remaining quantity.
    ///
    /// Partial slices are rounded to cents; taking everything that is left
    /// returns the exact remaining cost, so the slices of a lot sum to its
    /// cost.
    pub fn cost_of(&self, quantity: Decimal) -> Decimal {
        if quantity >= self.remaining_quantity {
            self.remaining_cost_eur
        } else {
            round_cents(self.remaining_cost_eur * quantity / self.remaining_quantity)
        }
    }

    pub(crate) fn take(&mut self, quantity: Decimal, cost_eur: Decimal) {
        self.remaining_quantity -= quantity;
        self.remaining_cost_eur -= cost_eur;
    }

    /// Human readable reference, e.g. `BTC#3`
    pub fn reference(&self) -> String {
        lot_reference(&self.asset, self.id)
    }
}

pub fn lot_reference(asset: &str, id: LotId) -> String {
    format!("{}#{}", asset, id)
}
