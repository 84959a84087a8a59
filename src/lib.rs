//! German tax-lot accounting for crypto assets.
//!
//! Transactions are ingested into a per-asset FIFO [`Ledger`], disposals are
//! classified against the one-year Spekulationsfrist and a
//! [`ReportAggregator`] turns a ledger snapshot into tax-year reports and
//! portfolio valuations.

pub mod prices;
pub mod tax;
pub mod transaction;
pub mod utils;

pub use prices::{PriceHistory, PriceResolver, PriceUnavailable};
pub use tax::{Ledger, LedgerError, ReportAggregator, TaxReport, TaxRules, TaxYear};
pub use transaction::{Transaction, TransactionKind};
