//! Tax-year reports and portfolio valuation over a ledger snapshot.

use crate::prices::{resolve, PriceResolver, PriceUnavailable};
use crate::tax::classify::{classify_with, TaxEvent};
use crate::tax::de::{holding_days, TaxRules, TaxYear};
use crate::tax::income::{IncomeEvent, IncomeSummary};
use crate::tax::ledger::LedgerSnapshot;
use crate::tax::lot::Lot;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeSet;

/// An open lot valued at the report time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpenLotValuation {
    pub reference: String,
    pub lot: Lot,
    pub holding_days: i64,
    /// Still inside the Spekulationsfrist at the report time
    pub would_be_taxable: bool,
    pub cost_basis_eur: Decimal,
    pub market_price_eur: Option<Decimal>,
    pub market_value_eur: Option<Decimal>,
    pub unrealized_gain_eur: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaxReport {
    pub tax_year: TaxYear,
    pub report_time: DateTime<Utc>,
    pub rules: TaxRules,
    /// Every disposal of the year, taxable and exempt, one per matched lot
    pub events: Vec<TaxEvent>,
    pub taxable_proceeds_eur: Decimal,
    pub taxable_cost_eur: Decimal,
    pub taxable_fees_eur: Decimal,
    /// Sum of gains and losses inside the Spekulationsfrist
    pub net_taxable_gain_eur: Decimal,
    /// Net taxable gain after the Freigrenze; negative for an offsettable loss
    pub taxable_gain_eur: Decimal,
    pub below_freigrenze: bool,
    /// Gains on lots held longer than the Spekulationsfrist
    pub exempt_gain_eur: Decimal,
    pub income: IncomeSummary,
    pub open_lots: Vec<OpenLotValuation>,
}

impl TaxReport {
    pub fn taxable_events(&self) -> impl Iterator<Item = &TaxEvent> {
        self.events.iter().filter(|e| e.is_taxable)
    }

    pub fn exempt_events(&self) -> impl Iterator<Item = &TaxEvent> {
        self.events.iter().filter(|e| !e.is_taxable)
    }

    pub fn unrealized_gain_eur(&self) -> Option<Decimal> {
        self.open_lots.iter().map(|l| l.unrealized_gain_eur).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetValue {
    pub asset: String,
    pub quantity: Decimal,
    pub price_eur: Decimal,
    pub value_eur: Decimal,
    pub cost_basis_eur: Decimal,
}

/// Holdings valued at one instant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortfolioValue {
    pub as_of: DateTime<Utc>,
    pub assets: Vec<AssetValue>,
    pub total_value_eur: Decimal,
    pub total_cost_basis_eur: Decimal,
}

/// Per-asset position with invested capital and return
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Standing {
    pub asset: String,
    pub quantity: Decimal,
    pub invested_eur: Decimal,
    pub worth_eur: Decimal,
    /// `(worth - invested) / invested`, absent when nothing is invested
    pub return_ratio: Option<Decimal>,
}

fn return_ratio(invested: Decimal, worth: Decimal) -> Option<Decimal> {
    (!invested.is_zero()).then(|| (worth - invested) / invested)
}

/// Builds reports from an immutable ledger snapshot
pub struct ReportAggregator<'a, P: ?Sized> {
    snapshot: LedgerSnapshot,
    resolver: &'a P,
    rules: TaxRules,
    report_time: DateTime<Utc>,
}

impl<'a, P: PriceResolver + ?Sized> ReportAggregator<'a, P> {
    pub fn new(snapshot: LedgerSnapshot, resolver: &'a P) -> Self {
        ReportAggregator {
            snapshot,
            resolver,
            rules: TaxRules::default(),
            report_time: Utc::now(),
        }
    }

    pub fn with_rules(mut self, rules: TaxRules) -> Self {
        self.rules = rules;
        self
    }

    /// Instant open lots are valued at
    pub fn at(mut self, report_time: DateTime<Utc>) -> Self {
        self.report_time = report_time;
        self
    }

    pub fn rules(&self) -> &TaxRules {
        &self.rules
    }

    pub fn snapshot(&self) -> &LedgerSnapshot {
        &self.snapshot
    }

    /// All classified disposals, ordered by disposal time
    pub fn tax_events(&self) -> Vec<TaxEvent> {
        let mut events: Vec<TaxEvent> = self
            .snapshot
            .books()
            .flat_map(|book| book.disposals())
            .flat_map(|disposal| classify_with(disposal, &self.rules))
            .collect();
        events.sort_by(|a, b| {
            (a.disposed_at, &a.source_id, a.lot_id).cmp(&(b.disposed_at, &b.source_id, b.lot_id))
        });
        events
    }

    pub fn income_events(&self) -> Vec<IncomeEvent> {
        let mut events: Vec<IncomeEvent> = self
            .snapshot
            .books()
            .flat_map(|book| book.income_events().iter().cloned())
            .collect();
        events.sort_by(|a, b| (a.received_at, &a.source_id).cmp(&(b.received_at, &b.source_id)));
        events
    }

    /// Tax years with at least one disposal or income event
    pub fn years(&self) -> Vec<TaxYear> {
        let mut years: BTreeSet<TaxYear> = self.tax_events().iter().map(|e| e.tax_year).collect();
        years.extend(self.income_events().iter().map(|e| e.tax_year));
        years.into_iter().collect()
    }

    /// Lots open at the report time, as they stood then, valued at that
    /// instant.
    ///
    /// A missing price leaves the market fields empty.
    pub fn open_lots(&self) -> Vec<OpenLotValuation> {
        self.snapshot
            .books()
            .flat_map(|book| book.holdings_at(self.report_time))
            .map(|lot| self.value_lot(&lot, self.report_time))
            .collect()
    }

    fn value_lot(&self, lot: &Lot, at: DateTime<Utc>) -> OpenLotValuation {
        let market_price_eur = match resolve(self.resolver, &lot.asset, at) {
            Ok(price) => Some(price),
            Err(e) => {
                log::warn!("{}: {}", lot.reference(), e);
                None
            }
        };
        let cost_basis_eur = lot.cost_basis_eur();
        let market_value_eur = market_price_eur.map(|p| p * lot.remaining_quantity);
        let days = holding_days(lot.acquired_at, at);

        OpenLotValuation {
            reference: lot.reference(),
            lot: lot.clone(),
            holding_days: days,
            would_be_taxable: self.rules.is_taxable(days),
            cost_basis_eur,
            market_price_eur,
            market_value_eur,
            unrealized_gain_eur: market_value_eur.map(|v| v - cost_basis_eur),
        }
    }

    pub fn build_report(&self, tax_year: TaxYear) -> TaxReport {
        let events: Vec<TaxEvent> = self
            .tax_events()
            .into_iter()
            .filter(|e| e.tax_year == tax_year)
            .collect();

        let mut taxable_proceeds_eur = Decimal::ZERO;
        let mut taxable_cost_eur = Decimal::ZERO;
        let mut taxable_fees_eur = Decimal::ZERO;
        let mut net_taxable_gain_eur = Decimal::ZERO;
        let mut exempt_gain_eur = Decimal::ZERO;
        for event in &events {
            if event.is_taxable {
                taxable_proceeds_eur += event.proceeds_eur;
                taxable_cost_eur += event.cost_eur;
                taxable_fees_eur += event.fee_eur;
                net_taxable_gain_eur += event.gain_eur;
            } else {
                exempt_gain_eur += event.gain_eur;
            }
        }

        let taxable_gain_eur = self.rules.apply_freigrenze(net_taxable_gain_eur);
        log::debug!(
            "{}: net taxable gain {}, after Freigrenze {}",
            tax_year,
            net_taxable_gain_eur,
            taxable_gain_eur
        );

        TaxReport {
            tax_year,
            report_time: self.report_time,
            rules: self.rules,
            taxable_proceeds_eur,
            taxable_cost_eur,
            taxable_fees_eur,
            net_taxable_gain_eur,
            taxable_gain_eur,
            below_freigrenze: net_taxable_gain_eur >= Decimal::ZERO
                && net_taxable_gain_eur < self.rules.freigrenze_eur,
            exempt_gain_eur,
            income: IncomeSummary::new(tax_year, &self.income_events(), &self.rules),
            open_lots: self.open_lots(),
            events,
        }
    }

    /// Holdings at `as_of` valued at the price at `as_of`
    pub fn portfolio_value(&self, as_of: DateTime<Utc>) -> Result<PortfolioValue, PriceUnavailable> {
        let mut assets = Vec::new();
        for book in self.snapshot.books() {
            let lots = book.holdings_at(as_of);
            if lots.is_empty() {
                continue;
            }
            let quantity: Decimal = lots.iter().map(|l| l.remaining_quantity).sum();
            let cost_basis_eur: Decimal = lots.iter().map(Lot::cost_basis_eur).sum();
            let price_eur = resolve(self.resolver, book.asset(), as_of)?;
            assets.push(AssetValue {
                asset: book.asset().to_string(),
                quantity,
                price_eur,
                value_eur: quantity * price_eur,
                cost_basis_eur,
            });
        }

        Ok(PortfolioValue {
            as_of,
            total_value_eur: assets.iter().map(|a| a.value_eur).sum(),
            total_cost_basis_eur: assets.iter().map(|a| a.cost_basis_eur).sum(),
            assets,
        })
    }

    pub fn valuation_series(
        &self,
        points: impl IntoIterator<Item = DateTime<Utc>>,
    ) -> Result<Vec<PortfolioValue>, PriceUnavailable> {
        points
            .into_iter()
            .map(|as_of| self.portfolio_value(as_of))
            .collect()
    }

    /// Positions at `as_of`, largest current worth first
    pub fn standings(&self, as_of: DateTime<Utc>) -> Result<Vec<Standing>, PriceUnavailable> {
        let value = self.portfolio_value(as_of)?;
        let mut standings: Vec<Standing> = value
            .assets
            .into_iter()
            .map(|a| Standing {
                return_ratio: return_ratio(a.cost_basis_eur, a.value_eur),
                asset: a.asset,
                quantity: a.quantity,
                invested_eur: a.cost_basis_eur,
                worth_eur: a.value_eur,
            })
            .collect();
        standings.sort_by(|a, b| b.worth_eur.cmp(&a.worth_eur).then_with(|| a.asset.cmp(&b.asset)));
        Ok(standings)
    }
}
