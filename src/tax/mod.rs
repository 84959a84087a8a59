pub mod classify;
pub mod de;
pub mod income;
pub mod ledger;
pub mod lot;
pub mod report;

pub use classify::{classify, classify_with, TaxEvent};
pub use de::{TaxRules, TaxYear};
pub use income::{IncomeEvent, IncomeSummary};
pub use ledger::{
    AssetBook, DisposalKind, DisposalMatch, FeeApplication, Ingested, Ledger, LedgerError,
    LedgerSnapshot, MatchEntry,
};
pub use lot::{Lot, LotId, LotOrigin, LotState};
pub use report::{PortfolioValue, ReportAggregator, Standing, TaxReport};
