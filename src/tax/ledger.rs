//! Per-asset FIFO lot ledger.
//!
//! Every asset has its own [`AssetBook`]: an append-only log of lot mutations
//! plus the current lot view derived from it. Books live behind one mutex per
//! asset and are copy-on-write, so a reader clones an `Arc` and keeps a
//! consistent book while other assets (or later transactions) move on.
//!
//! Ingesting a transaction is all-or-nothing. Prices are resolved first with
//! no lock held, then a [`PlannedChange`] is computed against the current book
//! and only committed once it is known to succeed.

use crate::prices::{resolve, PriceResolver, PriceUnavailable};
use crate::tax::de::{holding_days, TaxYear};
use crate::tax::income::IncomeEvent;
use crate::tax::lot::{lot_reference, Lot, LotId, LotOrigin};
use crate::transaction::{Transaction, TransactionError, TransactionKind};
use crate::utils::round_cents;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rayon::prelude::*;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error(transparent)]
    PriceUnavailable(#[from] PriceUnavailable),
    #[error("{source_id}: disposing {required} {asset} but only {available} held in open lots")]
    InsufficientLots {
        asset: String,
        source_id: String,
        required: Decimal,
        available: Decimal,
    },
    #[error("{source_id}: fee of {quantity} {asset} with no lot ever held")]
    OrphanedFee {
        asset: String,
        source_id: String,
        quantity: Decimal,
    },
    #[error(
        "{source_id} at {timestamp} is not after {last_source_id} at {last_timestamp} for {asset}"
    )]
    NonMonotonicTimestamp {
        asset: String,
        source_id: String,
        timestamp: DateTime<Utc>,
        last_source_id: String,
        last_timestamp: DateTime<Utc>,
    },
    #[error(transparent)]
    InvalidTransaction(#[from] TransactionError),
}

impl LedgerError {
    /// Source id of the transaction that failed, where one is known
    pub fn source_id(&self) -> Option<&str> {
        match self {
            LedgerError::InsufficientLots { source_id, .. }
            | LedgerError::OrphanedFee { source_id, .. }
            | LedgerError::NonMonotonicTimestamp { source_id, .. } => Some(source_id),
            LedgerError::PriceUnavailable(_) | LedgerError::InvalidTransaction(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DisposalKind {
    Disposal,
    /// Withdrawal to an untracked wallet, treated as a sale at market value
    TransferOut,
}

impl DisposalKind {
    pub fn display(&self) -> &'static str {
        match self {
            DisposalKind::Disposal => "Disposal",
            DisposalKind::TransferOut => "Transfer Out",
        }
    }
}

/// The part of a disposal matched against one lot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchEntry {
    pub lot_id: LotId,
    pub acquired_at: DateTime<Utc>,
    pub quantity_consumed: Decimal,
    pub unit_cost_eur: Decimal,
    /// Share of the lot's cost carried by the consumed quantity
    pub cost_eur: Decimal,
    pub unit_proceeds_eur: Decimal,
    pub holding_days: i64,
    pub allocated_fee_eur: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisposalMatch {
    pub source_id: String,
    pub asset: String,
    pub kind: DisposalKind,
    pub disposed_at: DateTime<Utc>,
    pub quantity: Decimal,
    pub unit_proceeds_eur: Decimal,
    pub fee_eur: Decimal,
    /// FIFO order, oldest lot first
    pub entries: Vec<MatchEntry>,
}

impl DisposalMatch {
    pub fn proceeds_eur(&self) -> Decimal {
        self.quantity * self.unit_proceeds_eur
    }

    pub fn cost_eur(&self) -> Decimal {
        self.entries.iter().map(|e| e.cost_eur).sum()
    }

    pub fn lot_references(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|e| lot_reference(&self.asset, e.lot_id))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeeCharge {
    pub lot_id: LotId,
    pub quantity: Decimal,
    /// Cost basis that leaves the lot with the quantity
    pub cost_eur: Decimal,
}

/// Result of a fee paid in the asset itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeeApplication {
    pub source_id: String,
    pub asset: String,
    pub charged_at: DateTime<Utc>,
    pub quantity: Decimal,
    /// Newest lot first
    pub charges: Vec<FeeCharge>,
    /// Quantity no open lot could cover, charged against the next lot opened
    pub pooled: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Ingested {
    Lot(Lot),
    Reward { lot: Lot, income: IncomeEvent },
    Disposal(DisposalMatch),
    Fee(FeeApplication),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum LotMutation {
    /// Lot as created, before any pending fee debit is settled
    Opened(Lot),
    Consumed {
        lot_id: LotId,
        quantity: Decimal,
        cost_eur: Decimal,
    },
    FeeCharged {
        lot_id: LotId,
        quantity: Decimal,
        cost_eur: Decimal,
    },
    DebitPooled {
        quantity: Decimal,
    },
    DebitSettled {
        lot_id: LotId,
        quantity: Decimal,
        cost_eur: Decimal,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub source_id: String,
    pub mutation: LotMutation,
}

/// A validated change to one book, ready to commit
#[derive(Debug, Clone)]
pub struct PlannedChange {
    at: DateTime<Utc>,
    source_id: String,
    step: Step,
}

#[derive(Debug, Clone)]
enum Step {
    Open {
        lot: Lot,
        debit_settled: Decimal,
        income: Option<IncomeEvent>,
    },
    Dispose(DisposalMatch),
    Fee(FeeApplication),
}

/// Lots and mutation history of a single asset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetBook {
    asset: String,
    /// Every lot ever opened, in creation order
    lots: Vec<Lot>,
    log: Vec<LogEntry>,
    disposals: Vec<DisposalMatch>,
    income: Vec<IncomeEvent>,
    last_key: Option<(DateTime<Utc>, String)>,
    acquired: Decimal,
    disposed: Decimal,
    fee_charged: Decimal,
    pending_debit: Decimal,
}

impl AssetBook {
    pub fn new(asset: &str) -> Self {
        AssetBook {
            asset: asset.to_string(),
            lots: Vec::new(),
            log: Vec::new(),
            disposals: Vec::new(),
            income: Vec::new(),
            last_key: None,
            acquired: Decimal::ZERO,
            disposed: Decimal::ZERO,
            fee_charged: Decimal::ZERO,
            pending_debit: Decimal::ZERO,
        }
    }

    pub fn asset(&self) -> &str {
        &self.asset
    }

    /// No transaction has been applied yet
    pub fn is_empty(&self) -> bool {
        self.last_key.is_none()
    }

    /// Every lot, closed ones included
    pub fn lots(&self) -> &[Lot] {
        &self.lots
    }

    /// Open lots in FIFO order
    pub fn open_lots(&self) -> impl Iterator<Item = &Lot> {
        self.lots.iter().filter(|l| l.is_open())
    }

    /// Realized disposals in ingestion order
    pub fn disposals(&self) -> &[DisposalMatch] {
        &self.disposals
    }

    pub fn income_events(&self) -> &[IncomeEvent] {
        &self.income
    }

    pub fn open_quantity(&self) -> Decimal {
        self.open_lots().map(|l| l.remaining_quantity).sum()
    }

    pub fn cost_basis_eur(&self) -> Decimal {
        self.open_lots().map(Lot::cost_basis_eur).sum()
    }

    pub fn acquired_quantity(&self) -> Decimal {
        self.acquired
    }

    pub fn disposed_quantity(&self) -> Decimal {
        self.disposed
    }

    /// Fee quantity actually taken from lots
    pub fn fee_charged_quantity(&self) -> Decimal {
        self.fee_charged
    }

    /// Fee quantity waiting for the next lot
    pub fn pending_debit(&self) -> Decimal {
        self.pending_debit
    }

    /// `sum(remaining) + disposed + fee charged == acquired`
    pub fn is_conserved(&self) -> bool {
        self.open_quantity() + self.disposed + self.fee_charged == self.acquired
    }

    /// Every lot opened up to `as_of`, as it stood then, replayed from the
    /// mutation log
    pub fn lots_at(&self, as_of: DateTime<Utc>) -> Vec<Lot> {
        let mut lots: Vec<Lot> = Vec::new();
        for entry in self.log.iter().take_while(|e| e.at <= as_of) {
            match &entry.mutation {
                LotMutation::Opened(lot) => lots.push(lot.clone()),
                LotMutation::Consumed {
                    lot_id,
                    quantity,
                    cost_eur,
                }
                | LotMutation::FeeCharged {
                    lot_id,
                    quantity,
                    cost_eur,
                }
                | LotMutation::DebitSettled {
                    lot_id,
                    quantity,
                    cost_eur,
                } => {
                    if let Some(lot) = lots.iter_mut().rev().find(|l| l.id == *lot_id) {
                        lot.take(*quantity, *cost_eur);
                    }
                }
                LotMutation::DebitPooled { .. } => {}
            }
        }
        lots
    }

    /// Open lots as they stood at `as_of`
    pub fn holdings_at(&self, as_of: DateTime<Utc>) -> Vec<Lot> {
        let mut lots = self.lots_at(as_of);
        lots.retain(Lot::is_open);
        lots
    }

    pub fn quantity_at(&self, as_of: DateTime<Utc>) -> Decimal {
        self.holdings_at(as_of)
            .iter()
            .map(|l| l.remaining_quantity)
            .sum()
    }

    fn next_lot_id(&self) -> LotId {
        LotId(self.lots.len() as u64 + 1)
    }

    fn lot_mut(&mut self, id: LotId) -> Option<&mut Lot> {
        let index = usize::try_from(id.0).ok()?.checked_sub(1)?;
        self.lots.get_mut(index)
    }

    /// Reject `tx` unless its `(timestamp, source_id)` is after the last
    /// applied transaction
    fn check_order(&self, tx: &Transaction) -> Result<(), LedgerError> {
        match &self.last_key {
            Some((last_timestamp, last_source_id))
                if (tx.timestamp, tx.source_id.as_str())
                    <= (*last_timestamp, last_source_id.as_str()) =>
            {
                Err(LedgerError::NonMonotonicTimestamp {
                    asset: self.asset.clone(),
                    source_id: tx.source_id.clone(),
                    timestamp: tx.timestamp,
                    last_source_id: last_source_id.clone(),
                    last_timestamp: *last_timestamp,
                })
            }
            _ => Ok(()),
        }
    }

    /// Work out what `tx` does to this book without touching it.
    ///
    /// `unit_price_eur` is the price already resolved for `tx`; it is not
    /// needed for fee transactions.
    pub fn plan(
        &self,
        tx: &Transaction,
        unit_price_eur: Option<Decimal>,
    ) -> Result<PlannedChange, LedgerError> {
        tx.validate()?;
        self.check_order(tx)?;

        let price = || unit_price_eur.ok_or_else(|| PriceUnavailable::new(&tx.asset, tx.timestamp));
        let step = match tx.kind {
            TransactionKind::Acquisition => self.plan_open(tx, LotOrigin::Acquisition, price()?),
            TransactionKind::TransferIn => self.plan_open(tx, LotOrigin::TransferIn, price()?),
            TransactionKind::Reward => self.plan_open(tx, LotOrigin::Reward, price()?),
            TransactionKind::Disposal => self.plan_dispose(tx, DisposalKind::Disposal, price()?)?,
            TransactionKind::TransferOut => {
                self.plan_dispose(tx, DisposalKind::TransferOut, price()?)?
            }
            TransactionKind::Fee => self.plan_fee(tx)?,
        };

        Ok(PlannedChange {
            at: tx.timestamp,
            source_id: tx.source_id.clone(),
            step,
        })
    }

    fn plan_open(&self, tx: &Transaction, origin: LotOrigin, unit_price_eur: Decimal) -> Step {
        let fee_eur = match (origin, tx.fee) {
            (LotOrigin::Reward, Some(fee)) => {
                log::info!(
                    "{}: ignoring fee of {} on reward, cost basis is the value at receipt",
                    tx.source_id,
                    fee.amount
                );
                Decimal::ZERO
            }
            (_, Some(fee)) => fee.to_eur(unit_price_eur),
            (_, None) => Decimal::ZERO,
        };
        let cost_eur = tx.quantity * unit_price_eur + fee_eur;

        let debit_settled = self.pending_debit.min(tx.quantity);
        let lot = Lot {
            id: self.next_lot_id(),
            asset: self.asset.clone(),
            acquired_at: tx.timestamp,
            original_quantity: tx.quantity,
            remaining_quantity: tx.quantity,
            unit_cost_eur: cost_eur / tx.quantity,
            cost_eur,
            remaining_cost_eur: cost_eur,
            origin_transaction_id: tx.source_id.clone(),
            origin,
        };

        let income = (origin == LotOrigin::Reward).then(|| IncomeEvent {
            source_id: tx.source_id.clone(),
            asset: self.asset.clone(),
            quantity: tx.quantity,
            received_at: tx.timestamp,
            value_eur: tx.quantity * unit_price_eur,
            tax_year: TaxYear::from_datetime(tx.timestamp),
        });

        Step::Open {
            lot,
            debit_settled,
            income,
        }
    }

    fn plan_dispose(
        &self,
        tx: &Transaction,
        kind: DisposalKind,
        unit_price_eur: Decimal,
    ) -> Result<Step, LedgerError> {
        let available = self.open_quantity();
        if available < tx.quantity {
            return Err(LedgerError::InsufficientLots {
                asset: self.asset.clone(),
                source_id: tx.source_id.clone(),
                required: tx.quantity,
                available,
            });
        }

        let fee_eur = tx.fee.map(|f| f.to_eur(unit_price_eur)).unwrap_or_default();
        let mut entries = Vec::new();
        let mut outstanding = tx.quantity;
        let mut fee_allocated = Decimal::ZERO;

        for lot in self.open_lots() {
            if outstanding.is_zero() {
                break;
            }
            let consumed = outstanding.min(lot.remaining_quantity);
            outstanding -= consumed;

            // last entry takes the rounding remainder
            let allocated_fee_eur = if outstanding.is_zero() {
                fee_eur - fee_allocated
            } else {
                round_cents(fee_eur * consumed / tx.quantity)
            };
            fee_allocated += allocated_fee_eur;

            entries.push(MatchEntry {
                lot_id: lot.id,
                acquired_at: lot.acquired_at,
                quantity_consumed: consumed,
                unit_cost_eur: lot.unit_cost_eur,
                cost_eur: lot.cost_of(consumed),
                unit_proceeds_eur: unit_price_eur,
                holding_days: holding_days(lot.acquired_at, tx.timestamp),
                allocated_fee_eur,
            });
        }

        Ok(Step::Dispose(DisposalMatch {
            source_id: tx.source_id.clone(),
            asset: self.asset.clone(),
            kind,
            disposed_at: tx.timestamp,
            quantity: tx.quantity,
            unit_proceeds_eur: unit_price_eur,
            fee_eur,
            entries,
        }))
    }

    fn plan_fee(&self, tx: &Transaction) -> Result<Step, LedgerError> {
        if self.lots.is_empty() {
            return Err(LedgerError::OrphanedFee {
                asset: self.asset.clone(),
                source_id: tx.source_id.clone(),
                quantity: tx.quantity,
            });
        }

        let mut charges = Vec::new();
        let mut outstanding = tx.quantity;
        for lot in self.lots.iter().rev().filter(|l| l.is_open()) {
            if outstanding.is_zero() {
                break;
            }
            let quantity = outstanding.min(lot.remaining_quantity);
            outstanding -= quantity;
            charges.push(FeeCharge {
                lot_id: lot.id,
                quantity,
                cost_eur: lot.cost_of(quantity),
            });
        }

        Ok(Step::Fee(FeeApplication {
            source_id: tx.source_id.clone(),
            asset: self.asset.clone(),
            charged_at: tx.timestamp,
            quantity: tx.quantity,
            charges,
            pooled: outstanding,
        }))
    }

    /// Apply a change produced by [`AssetBook::plan`] on this same book
    pub fn commit(&mut self, change: PlannedChange) -> Ingested {
        let PlannedChange {
            at,
            source_id,
            step,
        } = change;

        let entry = |mutation| LogEntry {
            at,
            source_id: source_id.clone(),
            mutation,
        };

        let ingested = match step {
            Step::Open {
                mut lot,
                debit_settled,
                income,
            } => {
                log::debug!(
                    "{} OPEN {}: qty={}, unit_cost={}",
                    source_id,
                    lot.reference(),
                    lot.original_quantity,
                    lot.unit_cost_eur
                );
                self.log.push(entry(LotMutation::Opened(lot.clone())));
                self.acquired += lot.original_quantity;

                if debit_settled > Decimal::ZERO {
                    log::debug!(
                        "{} settling pooled fee debit of {} against {}",
                        source_id,
                        debit_settled,
                        lot.reference()
                    );
                    let cost_eur = lot.cost_of(debit_settled);
                    lot.take(debit_settled, cost_eur);
                    self.pending_debit -= debit_settled;
                    self.fee_charged += debit_settled;
                    self.log.push(entry(LotMutation::DebitSettled {
                        lot_id: lot.id,
                        quantity: debit_settled,
                        cost_eur,
                    }));
                }

                self.lots.push(lot.clone());
                match income {
                    Some(income) => {
                        self.income.push(income.clone());
                        Ingested::Reward { lot, income }
                    }
                    None => Ingested::Lot(lot),
                }
            }
            Step::Dispose(matched) => {
                for e in &matched.entries {
                    if let Some(lot) = self.lot_mut(e.lot_id) {
                        lot.take(e.quantity_consumed, e.cost_eur);
                    }
                    log::debug!(
                        "{} CONSUME {}: qty={}",
                        source_id,
                        lot_reference(&matched.asset, e.lot_id),
                        e.quantity_consumed
                    );
                    self.log.push(entry(LotMutation::Consumed {
                        lot_id: e.lot_id,
                        quantity: e.quantity_consumed,
                        cost_eur: e.cost_eur,
                    }));
                }
                self.disposed += matched.quantity;
                self.disposals.push(matched.clone());
                Ingested::Disposal(matched)
            }
            Step::Fee(application) => {
                for charge in &application.charges {
                    if let Some(lot) = self.lot_mut(charge.lot_id) {
                        lot.take(charge.quantity, charge.cost_eur);
                    }
                    self.fee_charged += charge.quantity;
                    self.log.push(entry(LotMutation::FeeCharged {
                        lot_id: charge.lot_id,
                        quantity: charge.quantity,
                        cost_eur: charge.cost_eur,
                    }));
                }
                if application.pooled > Decimal::ZERO {
                    log::warn!(
                        "{}: {} {} of fee not covered by open lots, charging it to the next lot",
                        source_id,
                        application.pooled,
                        application.asset
                    );
                    self.pending_debit += application.pooled;
                    self.log.push(entry(LotMutation::DebitPooled {
                        quantity: application.pooled,
                    }));
                }
                Ingested::Fee(application)
            }
        };

        self.last_key = Some((at, source_id));
        ingested
    }
}

type BookSlot = Arc<Mutex<Arc<AssetBook>>>;

/// Consistent view of every non-empty asset book
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerSnapshot {
    books: BTreeMap<String, Arc<AssetBook>>,
}

impl LedgerSnapshot {
    pub fn book(&self, asset: &str) -> Option<&AssetBook> {
        self.books.get(asset).map(Arc::as_ref)
    }

    /// Books sorted by asset symbol
    pub fn books(&self) -> impl Iterator<Item = &AssetBook> {
        self.books.values().map(Arc::as_ref)
    }

    pub fn assets(&self) -> impl Iterator<Item = &str> {
        self.books.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }

    pub fn is_conserved(&self) -> bool {
        self.books().all(AssetBook::is_conserved)
    }
}

/// Lot ledger over all assets
pub struct Ledger<P> {
    resolver: P,
    books: DashMap<String, BookSlot>,
}

impl<P: PriceResolver> Ledger<P> {
    pub fn new(resolver: P) -> Self {
        Ledger {
            resolver,
            books: DashMap::new(),
        }
    }

    pub fn resolver(&self) -> &P {
        &self.resolver
    }

    fn slot(&self, asset: &str) -> BookSlot {
        // the shard guard is dropped at the end of this statement
        self.books
            .entry(asset.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Arc::new(AssetBook::new(asset)))))
            .value()
            .clone()
    }

    fn unit_price(&self, tx: &Transaction) -> Result<Option<Decimal>, LedgerError> {
        if tx.kind == TransactionKind::Fee {
            return Ok(None);
        }
        match tx.unit_price_eur {
            Some(price) => Ok(Some(price)),
            None => Ok(Some(resolve(&self.resolver, &tx.asset, tx.timestamp)?)),
        }
    }

    /// Apply one transaction to its asset book
    pub fn ingest(&self, tx: &Transaction) -> Result<Ingested, LedgerError> {
        tx.validate()?;
        match tx.kind {
            TransactionKind::TransferIn => log::warn!(
                "{}: unlinked deposit of {} {}, opening a lot at market value",
                tx.source_id,
                tx.quantity,
                tx.asset
            ),
            TransactionKind::TransferOut => log::warn!(
                "{}: unlinked withdrawal of {} {}, treating it as a disposal at market value",
                tx.source_id,
                tx.quantity,
                tx.asset
            ),
            _ => {}
        }

        // out-of-order input is rejected before any price lookup
        let slot = self.slot(&tx.asset);
        slot.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .check_order(tx)?;

        let unit_price = self.unit_price(tx)?;

        let mut book = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let change = book.plan(tx, unit_price)?;
        Ok(Arc::make_mut(&mut book).commit(change))
    }

    /// Apply transactions in order, stopping at the first error
    pub fn ingest_all<'a>(
        &self,
        transactions: impl IntoIterator<Item = &'a Transaction>,
    ) -> Result<Vec<Ingested>, LedgerError> {
        transactions.into_iter().map(|tx| self.ingest(tx)).collect()
    }

    /// Apply transactions with independent assets ingested in parallel.
    ///
    /// Order is kept within each asset; each asset stops at its own first
    /// error without affecting the others.
    pub fn ingest_parallel(
        &self,
        transactions: &[Transaction],
    ) -> BTreeMap<String, Result<Vec<Ingested>, LedgerError>> {
        let mut per_asset: BTreeMap<String, Vec<&Transaction>> = BTreeMap::new();
        for tx in transactions {
            per_asset.entry(tx.asset.clone()).or_default().push(tx);
        }

        per_asset
            .into_par_iter()
            .map(|(asset, txs)| {
                let outcome = self.ingest_all(txs);
                (asset, outcome)
            })
            .collect()
    }

    /// Current book of one asset
    pub fn book(&self, asset: &str) -> Option<Arc<AssetBook>> {
        let slot = self.books.get(asset)?.value().clone();
        let book = slot.lock().unwrap_or_else(PoisonError::into_inner).clone();
        (!book.is_empty()).then_some(book)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let slots: Vec<(String, BookSlot)> = self
            .books
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();

        let books = slots
            .into_iter()
            .filter_map(|(asset, slot)| {
                let book = slot.lock().unwrap_or_else(PoisonError::into_inner).clone();
                (!book.is_empty()).then_some((asset, book))
            })
            .collect();

        LedgerSnapshot { books }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tax::lot::LotState;
    use crate::transaction::Fee;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn t(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 12, 0, 0).unwrap()
    }

    fn acq(id: &str, at: DateTime<Utc>, asset: &str, qty: Decimal, price: Decimal) -> Transaction {
        Transaction::new(id, at, TransactionKind::Acquisition, asset, qty).with_price(price)
    }

    fn disp(id: &str, at: DateTime<Utc>, asset: &str, qty: Decimal, price: Decimal) -> Transaction {
        Transaction::new(id, at, TransactionKind::Disposal, asset, qty).with_price(price)
    }

    fn fee(id: &str, at: DateTime<Utc>, asset: &str, qty: Decimal) -> Transaction {
        Transaction::new(id, at, TransactionKind::Fee, asset, qty)
    }

    fn no_prices(asset: &str, at: DateTime<Utc>) -> Result<Decimal, PriceUnavailable> {
        Err(PriceUnavailable::new(asset, at))
    }

    type Stub = fn(&str, DateTime<Utc>) -> Result<Decimal, PriceUnavailable>;

    fn ledger() -> Ledger<Stub> {
        Ledger::new(no_prices as Stub)
    }

    fn disposal(ingested: Ingested) -> DisposalMatch {
        match ingested {
            Ingested::Disposal(m) => m,
            other => panic!("expected disposal, got {:?}", other),
        }
    }

    #[test]
    fn fifo_consumes_oldest_lot_first() {
        let ledger = ledger();
        ledger.ingest(&acq("a1", t(1), "BTC", dec!(1), dec!(100))).unwrap();
        ledger.ingest(&acq("a2", t(2), "BTC", dec!(1), dec!(200))).unwrap();

        let m = disposal(ledger.ingest(&disp("d1", t(3), "BTC", dec!(0.5), dec!(300))).unwrap());
        assert_eq!(m.entries.len(), 1);
        assert_eq!(m.entries[0].lot_id, LotId(1));

        let book = ledger.book("BTC").unwrap();
        assert_eq!(book.lots()[0].remaining_quantity, dec!(0.5));
        assert_eq!(book.lots()[1].remaining_quantity, dec!(1));
    }

    #[test]
    fn partial_disposal_spans_two_lots() {
        let ledger = ledger();
        ledger.ingest(&acq("a1", t(1), "BTC", dec!(10), dec!(100))).unwrap();
        ledger.ingest(&acq("a2", t(2), "BTC", dec!(5), dec!(200))).unwrap();

        let m = disposal(ledger.ingest(&disp("d1", t(3), "BTC", dec!(12), dec!(300))).unwrap());
        assert_eq!(m.entries.len(), 2);
        assert_eq!(m.entries[0].lot_id, LotId(1));
        assert_eq!(m.entries[0].quantity_consumed, dec!(10));
        assert_eq!(m.entries[1].lot_id, LotId(2));
        assert_eq!(m.entries[1].quantity_consumed, dec!(2));
        assert_eq!(m.proceeds_eur(), dec!(3600));
        assert_eq!(m.cost_eur(), dec!(1400));
        assert_eq!(m.lot_references(), vec!["BTC#1", "BTC#2"]);

        let book = ledger.book("BTC").unwrap();
        assert_eq!(book.open_quantity(), dec!(3));
        assert!(book.is_conserved());
    }

    #[test]
    fn acquisition_fee_raises_unit_cost() {
        let ledger = ledger();
        let tx = acq("a1", t(1), "ETH", dec!(2), dec!(1000)).with_fee(Fee::eur(dec!(10)));
        match ledger.ingest(&tx).unwrap() {
            Ingested::Lot(lot) => assert_eq!(lot.unit_cost_eur, dec!(1005)),
            other => panic!("expected lot, got {:?}", other),
        }

        let tx = acq("a2", t(2), "ETH", dec!(1), dec!(1000)).with_fee(Fee::in_asset(dec!(0.01)));
        match ledger.ingest(&tx).unwrap() {
            Ingested::Lot(lot) => assert_eq!(lot.unit_cost_eur, dec!(1010)),
            other => panic!("expected lot, got {:?}", other),
        }
    }

    #[test]
    fn disposal_fee_allocated_proportionally() {
        let ledger = ledger();
        ledger.ingest(&acq("a1", t(1), "BTC", dec!(10), dec!(100))).unwrap();
        ledger.ingest(&acq("a2", t(2), "BTC", dec!(5), dec!(200))).unwrap();

        let tx = disp("d1", t(3), "BTC", dec!(12), dec!(300)).with_fee(Fee::eur(dec!(10)));
        let m = disposal(ledger.ingest(&tx).unwrap());
        assert_eq!(m.fee_eur, dec!(10));
        assert_eq!(m.entries[0].allocated_fee_eur, dec!(8.33));
        assert_eq!(m.entries[1].allocated_fee_eur, dec!(1.67));
        let total: Decimal = m.entries.iter().map(|e| e.allocated_fee_eur).sum();
        assert_eq!(total, dec!(10));
    }

    #[test]
    fn disposal_fee_in_asset_valued_at_proceeds_price() {
        let ledger = ledger();
        ledger.ingest(&acq("a1", t(1), "BTC", dec!(10), dec!(100))).unwrap();
        ledger.ingest(&acq("a2", t(2), "BTC", dec!(5), dec!(200))).unwrap();

        let tx = disp("d1", t(3), "BTC", dec!(12), dec!(300)).with_fee(Fee::in_asset(dec!(0.03)));
        let m = disposal(ledger.ingest(&tx).unwrap());
        assert_eq!(m.fee_eur, dec!(9));
        assert_eq!(m.entries[0].allocated_fee_eur, dec!(7.5));
        assert_eq!(m.entries[1].allocated_fee_eur, dec!(1.5));

        // the fee is a cost of the sale, not an extra quantity taken from lots
        let book = ledger.book("BTC").unwrap();
        assert_eq!(book.open_quantity(), dec!(3));
        assert_eq!(book.fee_charged_quantity(), dec!(0));
        assert!(book.is_conserved());
    }

    #[test]
    fn disposal_fee_cents_round_half_away_from_zero() {
        let ledger = ledger();
        ledger.ingest(&acq("a1", t(1), "BTC", dec!(1), dec!(100))).unwrap();
        ledger.ingest(&acq("a2", t(2), "BTC", dec!(7), dec!(100))).unwrap();

        // 0.2 * 1/8 = 0.025 sits exactly on the half cent
        let tx = disp("d1", t(3), "BTC", dec!(8), dec!(100)).with_fee(Fee::eur(dec!(0.2)));
        let m = disposal(ledger.ingest(&tx).unwrap());
        assert_eq!(m.entries[0].allocated_fee_eur, dec!(0.03));
        assert_eq!(m.entries[1].allocated_fee_eur, dec!(0.17));
    }

    #[test]
    fn acquisition_fee_cost_split_exactly_across_sales() {
        let ledger = ledger();
        let buy = acq("a1", t(1), "ETH", dec!(3), dec!(100)).with_fee(Fee::eur(dec!(20)));
        ledger.ingest(&buy).unwrap();

        let first = disposal(ledger.ingest(&disp("d1", t(2), "ETH", dec!(1), dec!(306.67))).unwrap());
        let second =
            disposal(ledger.ingest(&disp("d2", t(3), "ETH", dec!(2), dec!(306.665))).unwrap());

        assert_eq!(first.cost_eur(), dec!(106.67));
        assert_eq!(second.cost_eur(), dec!(213.33));
        let gain = first.proceeds_eur() - first.cost_eur() + second.proceeds_eur()
            - second.cost_eur();
        assert_eq!(gain, dec!(600));

        let book = ledger.book("ETH").unwrap();
        assert_eq!(book.lots()[0].remaining_cost_eur, dec!(0));
        assert!(book.is_conserved());
    }

    #[test]
    fn insufficient_lots_leaves_state_unchanged() {
        let ledger = ledger();
        let err = ledger.ingest(&disp("d1", t(1), "BTC", dec!(6), dec!(300))).unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientLots {
                asset: "BTC".to_string(),
                source_id: "d1".to_string(),
                required: dec!(6),
                available: dec!(0),
            }
        );
        assert!(ledger.snapshot().is_empty());

        ledger.ingest(&acq("a1", t(2), "BTC", dec!(5), dec!(100))).unwrap();
        let before = ledger.snapshot();
        assert!(ledger.ingest(&disp("d2", t(3), "BTC", dec!(6), dec!(300))).is_err());
        assert_eq!(ledger.snapshot(), before);
    }

    #[test]
    fn unavailable_price_leaves_state_unchanged() {
        let ledger = ledger();
        ledger.ingest(&acq("a1", t(1), "BTC", dec!(1), dec!(100))).unwrap();
        let before = ledger.snapshot();

        let tx = Transaction::new("d1", t(2), TransactionKind::Disposal, "BTC", dec!(1));
        assert_eq!(
            ledger.ingest(&tx),
            Err(LedgerError::PriceUnavailable(PriceUnavailable::new("BTC", t(2))))
        );
        assert_eq!(ledger.snapshot(), before);
    }

    #[test]
    fn prices_resolved_when_missing() {
        let ledger = Ledger::new(|_: &str, _: DateTime<Utc>| -> Result<Decimal, PriceUnavailable> {
            Ok(dec!(250))
        });
        let tx = Transaction::new("a1", t(1), TransactionKind::Acquisition, "SOL", dec!(4));
        match ledger.ingest(&tx).unwrap() {
            Ingested::Lot(lot) => assert_eq!(lot.unit_cost_eur, dec!(250)),
            other => panic!("expected lot, got {:?}", other),
        }
    }

    #[test]
    fn out_of_order_rejected() {
        let ledger = ledger();
        ledger.ingest(&acq("b", t(2), "BTC", dec!(1), dec!(100))).unwrap();
        let before = ledger.snapshot();

        let err = ledger.ingest(&acq("a", t(1), "BTC", dec!(1), dec!(100))).unwrap_err();
        assert!(matches!(err, LedgerError::NonMonotonicTimestamp { .. }));
        assert_eq!(err.source_id(), Some("a"));

        // same instant needs a greater source id
        let err = ledger.ingest(&acq("a", t(2), "BTC", dec!(1), dec!(100))).unwrap_err();
        assert!(matches!(err, LedgerError::NonMonotonicTimestamp { .. }));
        assert!(ledger.ingest(&acq("b", t(2), "BTC", dec!(1), dec!(100))).is_err());
        assert_eq!(ledger.snapshot(), before);

        ledger.ingest(&acq("c", t(2), "BTC", dec!(1), dec!(100))).unwrap();
        // other assets keep their own order
        ledger.ingest(&acq("a", t(1), "ETH", dec!(1), dec!(100))).unwrap();
    }

    #[test]
    fn out_of_order_rejected_before_price_lookup() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let lookups = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&lookups);
        let ledger = Ledger::new(
            move |asset: &str, at: DateTime<Utc>| -> Result<Decimal, PriceUnavailable> {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(PriceUnavailable::new(asset, at))
            },
        );
        ledger.ingest(&acq("b", t(2), "BTC", dec!(1), dec!(100))).unwrap();

        let late = Transaction::new("a", t(1), TransactionKind::Disposal, "BTC", dec!(1));
        let err = ledger.ingest(&late).unwrap_err();
        assert!(matches!(err, LedgerError::NonMonotonicTimestamp { .. }));
        assert_eq!(lookups.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn invalid_transaction_rejected() {
        let ledger = ledger();
        let tx = acq("a1", t(1), "BTC", dec!(-1), dec!(100));
        assert!(matches!(
            ledger.ingest(&tx),
            Err(LedgerError::InvalidTransaction(
                TransactionError::NonPositiveQuantity { .. }
            ))
        ));
    }

    #[test]
    fn reward_opens_lot_and_emits_income() {
        let ledger = ledger();
        let tx = Transaction::new("r1", t(1), TransactionKind::Reward, "ETH", dec!(0.5))
            .with_price(dec!(2000))
            .with_fee(Fee::eur(dec!(1)));
        match ledger.ingest(&tx).unwrap() {
            Ingested::Reward { lot, income } => {
                assert_eq!(lot.origin, LotOrigin::Reward);
                assert_eq!(lot.unit_cost_eur, dec!(2000));
                assert_eq!(income.value_eur, dec!(1000));
                assert_eq!(income.tax_year, TaxYear(2024));
            }
            other => panic!("expected reward, got {:?}", other),
        }
    }

    #[test]
    fn transfers_are_unlinked_acquisitions_and_disposals() {
        let ledger = ledger();
        let deposit = Transaction::new("in", t(1), TransactionKind::TransferIn, "BTC", dec!(1))
            .with_price(dec!(100));
        match ledger.ingest(&deposit).unwrap() {
            Ingested::Lot(lot) => assert_eq!(lot.origin, LotOrigin::TransferIn),
            other => panic!("expected lot, got {:?}", other),
        }

        let withdrawal = Transaction::new("out", t(2), TransactionKind::TransferOut, "BTC", dec!(1))
            .with_price(dec!(150));
        let m = disposal(ledger.ingest(&withdrawal).unwrap());
        assert_eq!(m.kind, DisposalKind::TransferOut);
        assert_eq!(m.proceeds_eur(), dec!(150));
    }

    #[test]
    fn fee_charges_newest_lot_first() {
        let ledger = ledger();
        ledger.ingest(&acq("a1", t(1), "ETH", dec!(1), dec!(100))).unwrap();
        ledger.ingest(&acq("a2", t(2), "ETH", dec!(0.01), dec!(100))).unwrap();

        match ledger.ingest(&fee("f1", t(3), "ETH", dec!(0.03))).unwrap() {
            Ingested::Fee(application) => {
                assert_eq!(
                    application.charges,
                    vec![
                        FeeCharge {
                            lot_id: LotId(2),
                            quantity: dec!(0.01),
                            cost_eur: dec!(1),
                        },
                        FeeCharge {
                            lot_id: LotId(1),
                            quantity: dec!(0.02),
                            cost_eur: dec!(2),
                        },
                    ]
                );
                assert_eq!(application.pooled, dec!(0));
            }
            other => panic!("expected fee, got {:?}", other),
        }

        let book = ledger.book("ETH").unwrap();
        assert_eq!(book.open_quantity(), dec!(0.98));
        assert_eq!(book.lots()[0].unit_cost_eur, dec!(100));
        assert_eq!(book.lots()[0].cost_basis_eur(), dec!(98));
        assert_eq!(book.lots()[1].cost_basis_eur(), dec!(0));
        assert!(book.is_conserved());
    }

    #[test]
    fn uncovered_fee_pooled_until_next_lot() {
        let ledger = ledger();
        ledger.ingest(&acq("a1", t(1), "ETH", dec!(1), dec!(100))).unwrap();
        ledger.ingest(&disp("d1", t(2), "ETH", dec!(1), dec!(150))).unwrap();

        match ledger.ingest(&fee("f1", t(3), "ETH", dec!(0.1))).unwrap() {
            Ingested::Fee(application) => {
                assert!(application.charges.is_empty());
                assert_eq!(application.pooled, dec!(0.1));
            }
            other => panic!("expected fee, got {:?}", other),
        }
        let book = ledger.book("ETH").unwrap();
        assert_eq!(book.pending_debit(), dec!(0.1));
        assert!(book.is_conserved());

        ledger.ingest(&acq("a2", t(4), "ETH", dec!(2), dec!(100))).unwrap();
        let book = ledger.book("ETH").unwrap();
        assert_eq!(book.pending_debit(), dec!(0));
        assert_eq!(book.lots()[1].remaining_quantity, dec!(1.9));
        assert_eq!(book.lots()[1].original_quantity, dec!(2));
        assert!(book.is_conserved());
    }

    #[test]
    fn pooled_fee_larger_than_next_lot_carries_over() {
        let ledger = ledger();
        ledger.ingest(&acq("a1", t(1), "ETH", dec!(1), dec!(100))).unwrap();
        ledger.ingest(&disp("d1", t(2), "ETH", dec!(1), dec!(150))).unwrap();
        ledger.ingest(&fee("f1", t(3), "ETH", dec!(0.5))).unwrap();

        // the next lot is used up by the debit the moment it opens
        match ledger.ingest(&acq("a2", t(4), "ETH", dec!(0.2), dec!(100))).unwrap() {
            Ingested::Lot(lot) => {
                assert_eq!(lot.remaining_quantity, dec!(0));
                assert_eq!(lot.state(), LotState::Closed);
                assert_eq!(lot.cost_basis_eur(), dec!(0));
            }
            other => panic!("expected lot, got {:?}", other),
        }
        let book = ledger.book("ETH").unwrap();
        assert_eq!(book.pending_debit(), dec!(0.3));
        assert_eq!(book.fee_charged_quantity(), dec!(0.2));
        assert!(book.is_conserved());

        ledger.ingest(&acq("a3", t(5), "ETH", dec!(1), dec!(100))).unwrap();
        let book = ledger.book("ETH").unwrap();
        assert_eq!(book.pending_debit(), dec!(0));
        assert_eq!(book.lots()[2].remaining_quantity, dec!(0.7));
        assert_eq!(book.lots()[2].cost_basis_eur(), dec!(70));
        assert_eq!(book.fee_charged_quantity(), dec!(0.5));
        assert!(book.is_conserved());

        // a disposal now cannot reach into the closed lot
        assert!(matches!(
            ledger.ingest(&disp("d2", t(6), "ETH", dec!(0.8), dec!(150))),
            Err(LedgerError::InsufficientLots { .. })
        ));
    }

    #[test]
    fn fee_without_history_is_orphaned() {
        let ledger = ledger();
        assert_eq!(
            ledger.ingest(&fee("f1", t(1), "ETH", dec!(0.1))),
            Err(LedgerError::OrphanedFee {
                asset: "ETH".to_string(),
                source_id: "f1".to_string(),
                quantity: dec!(0.1),
            })
        );
        assert!(ledger.snapshot().is_empty());
    }

    #[test]
    fn conservation_holds_after_every_step() {
        let ledger = ledger();
        let stream = vec![
            acq("1", t(1), "BTC", dec!(2), dec!(100)),
            fee("2", t(2), "BTC", dec!(0.001)),
            disp("3", t(3), "BTC", dec!(1.5), dec!(120)),
            acq("4", t(4), "BTC", dec!(0.3), dec!(110)),
            disp("5", t(5), "BTC", dec!(0.799), dec!(130)),
            fee("6", t(6), "BTC", dec!(0.01)),
            acq("7", t(7), "BTC", dec!(1), dec!(90)),
        ];
        for tx in &stream {
            ledger.ingest(tx).unwrap();
            assert!(ledger.snapshot().is_conserved());
        }
        let book = ledger.book("BTC").unwrap();
        assert_eq!(book.acquired_quantity(), dec!(3.3));
        assert_eq!(book.disposed_quantity(), dec!(2.299));
        assert_eq!(book.fee_charged_quantity(), dec!(0.011));
        assert_eq!(book.open_quantity(), dec!(0.99));
    }

    #[test]
    fn holdings_replayed_from_log() {
        let ledger = ledger();
        ledger.ingest(&acq("a1", t(1), "BTC", dec!(10), dec!(100))).unwrap();
        ledger.ingest(&acq("a2", t(2), "BTC", dec!(5), dec!(200))).unwrap();
        ledger.ingest(&disp("d1", t(3), "BTC", dec!(12), dec!(300))).unwrap();

        let book = ledger.book("BTC").unwrap();
        assert_eq!(book.quantity_at(t(1) - Duration::seconds(1)), dec!(0));
        assert_eq!(book.quantity_at(t(1)), dec!(10));
        assert_eq!(book.quantity_at(t(2)), dec!(15));
        assert_eq!(book.quantity_at(t(3)), dec!(3));

        let before_sale = book.holdings_at(t(2));
        assert_eq!(before_sale.len(), 2);
        assert_eq!(before_sale[0].cost_basis_eur(), dec!(1000));
        assert_eq!(book.holdings_at(t(3)), book.open_lots().cloned().collect::<Vec<_>>());

        // closed lots are kept with their state at the instant
        let after_sale = book.lots_at(t(3));
        assert_eq!(after_sale.len(), 2);
        assert_eq!(after_sale[0].state(), LotState::Closed);
        assert_eq!(after_sale[1].remaining_quantity, dec!(3));
        assert_eq!(after_sale[1].cost_basis_eur(), dec!(600));
        assert!(book.lots_at(t(1) - Duration::seconds(1)).is_empty());
    }

    #[test]
    fn snapshot_is_isolated_from_later_ingestion() {
        let ledger = ledger();
        ledger.ingest(&acq("a1", t(1), "BTC", dec!(1), dec!(100))).unwrap();
        let snapshot = ledger.snapshot();

        ledger.ingest(&disp("d1", t(2), "BTC", dec!(1), dec!(100))).unwrap();
        assert_eq!(snapshot.book("BTC").unwrap().open_quantity(), dec!(1));
        assert_eq!(ledger.book("BTC").unwrap().open_quantity(), dec!(0));
    }

    fn mixed_stream() -> Vec<Transaction> {
        let mut stream = Vec::new();
        for day in 1..=20u32 {
            stream.push(acq(&format!("b{day:02}"), t(day), "BTC", dec!(0.1), Decimal::from(day * 1000)));
            stream.push(acq(&format!("e{day:02}"), t(day), "ETH", dec!(1), Decimal::from(day * 100)));
            if day % 3 == 0 {
                stream.push(disp(&format!("sb{day:02}"), t(day), "BTC", dec!(0.15), dec!(30000)));
                stream.push(disp(&format!("se{day:02}"), t(day), "ETH", dec!(1.5), dec!(2000)));
            }
        }
        crate::transaction::sort_transactions(&mut stream);
        stream
    }

    #[test]
    fn reingestion_is_idempotent() {
        let stream = mixed_stream();

        let first = ledger();
        let first_out = first.ingest_all(&stream).unwrap();
        let second = ledger();
        let second_out = second.ingest_all(&stream).unwrap();

        assert_eq!(first_out, second_out);
        assert_eq!(first.snapshot(), second.snapshot());
    }

    #[test]
    fn parallel_matches_sequential() {
        let stream = mixed_stream();

        let sequential = ledger();
        sequential.ingest_all(&stream).unwrap();

        let parallel = ledger();
        let outcomes = parallel.ingest_parallel(&stream);
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.values().all(Result::is_ok));

        assert_eq!(sequential.snapshot(), parallel.snapshot());
    }

    #[test]
    fn parallel_errors_stay_per_asset() {
        let stream = vec![
            acq("a1", t(1), "BTC", dec!(1), dec!(100)),
            disp("d1", t(2), "ETH", dec!(1), dec!(100)),
            acq("a2", t(3), "ETH", dec!(1), dec!(100)),
        ];
        let ledger = ledger();
        let outcomes = ledger.ingest_parallel(&stream);

        assert_eq!(outcomes["BTC"].as_ref().map(Vec::len), Ok(1));
        assert!(matches!(
            outcomes["ETH"],
            Err(LedgerError::InsufficientLots { .. })
        ));
        assert!(ledger.book("ETH").is_none());
    }
}
