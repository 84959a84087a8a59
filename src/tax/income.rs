use crate::tax::de::{TaxRules, TaxYear};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

/// Staking reward or airdrop valued at receipt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncomeEvent {
    pub source_id: String,
    pub asset: String,
    pub quantity: Decimal,
    pub received_at: DateTime<Utc>,
    pub value_eur: Decimal,
    pub tax_year: TaxYear,
}

/// Income for one tax year
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncomeSummary {
    pub tax_year: TaxYear,
    pub events: Vec<IncomeEvent>,
    pub total_eur: Decimal,
    /// Total stays below the income Freigrenze
    pub below_freigrenze: bool,
}

impl IncomeSummary {
    pub fn new<'a>(
        tax_year: TaxYear,
        events: impl IntoIterator<Item = &'a IncomeEvent>,
        rules: &TaxRules,
    ) -> Self {
        let events: Vec<IncomeEvent> = events
            .into_iter()
            .filter(|e| e.tax_year == tax_year)
            .cloned()
            .collect();
        let total_eur = events.iter().map(|e| e.value_eur).sum();
        IncomeSummary {
            tax_year,
            below_freigrenze: rules.income_exempt(total_eur),
            events,
            total_eur,
        }
    }
}
