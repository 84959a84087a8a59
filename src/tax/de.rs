use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::fmt;

/// Private sales held for at most this many days are taxable (§23 EStG)
pub const SPECULATION_PERIOD_DAYS: i64 = 365;

/// Freigrenze for private sales: below it the whole net gain is tax-free
pub const FREIGRENZE_EUR: Decimal = dec!(600);

/// Freigrenze for other income such as staking rewards (§22 Nr. 3 EStG)
pub const INCOME_FREIGRENZE_EUR: Decimal = dec!(256);

/// German tax year, i.e. the calendar year in UTC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaxYear(pub i32);

impl TaxYear {
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        TaxYear(at.year())
    }

    /// First day of the tax year (1 January)
    pub fn start_date(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.0, 1, 1)
    }

    /// Last day of the tax year (31 December)
    pub fn end_date(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.0, 12, 31)
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at.year() == self.0
    }

    pub fn display(&self) -> String {
        self.0.to_string()
    }
}

impl fmt::Display for TaxYear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Elapsed calendar days between acquisition and disposal, in UTC
pub fn holding_days(acquired_at: DateTime<Utc>, disposed_at: DateTime<Utc>) -> i64 {
    (disposed_at.date_naive() - acquired_at.date_naive()).num_days()
}

/// Thresholds applied when classifying disposals and building reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TaxRules {
    pub speculation_period_days: i64,
    pub freigrenze_eur: Decimal,
    pub income_freigrenze_eur: Decimal,
}

impl Default for TaxRules {
    fn default() -> Self {
        TaxRules {
            speculation_period_days: SPECULATION_PERIOD_DAYS,
            freigrenze_eur: FREIGRENZE_EUR,
            income_freigrenze_eur: INCOME_FREIGRENZE_EUR,
        }
    }
}

impl TaxRules {
    pub fn with_freigrenze(mut self, freigrenze_eur: Decimal) -> Self {
        self.freigrenze_eur = freigrenze_eur;
        self
    }

    pub fn with_income_freigrenze(mut self, income_freigrenze_eur: Decimal) -> Self {
        self.income_freigrenze_eur = income_freigrenze_eur;
        self
    }

    pub fn is_taxable(&self, holding_days: i64) -> bool {
        holding_days <= self.speculation_period_days
    }

    /// Taxable amount left after the Freigrenze.
    ///
    /// A net gain below the threshold is reported as zero, a gain at or above
    /// it in full. A net loss passes through unchanged so it can be offset.
    pub fn apply_freigrenze(&self, net_gain_eur: Decimal) -> Decimal {
        if net_gain_eur >= Decimal::ZERO && net_gain_eur < self.freigrenze_eur {
            Decimal::ZERO
        } else {
            net_gain_eur
        }
    }

    pub fn income_exempt(&self, income_eur: Decimal) -> bool {
        income_eur < self.income_freigrenze_eur
    }
}
