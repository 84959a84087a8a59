//! Lots command - lot list with state and unrealized gain

use crate::cmd::{parse_instant, table, InputArgs};
use clap::Args;
use serde::Serialize;
use std::collections::HashMap;
use steuerc::tax::report::OpenLotValuation;
use steuerc::tax::{Lot, ReportAggregator};
use steuerc::utils::{format_eur, format_optional_eur, format_quantity};
use tabled::Tabled;

#[derive(Args, Debug)]
pub struct LotsCommand {
    #[command(flatten)]
    input: InputArgs,

    /// Filter by asset (e.g., BTC, ETH)
    #[arg(short, long)]
    asset: Option<String>,

    /// Include closed lots
    #[arg(long)]
    all: bool,

    /// Instant the lots are shown and valued at. Defaults to now.
    #[arg(long)]
    at: Option<String>,

    /// Output as JSON instead of formatted table
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct LotView<'a> {
    reference: String,
    state: &'static str,
    #[serde(flatten)]
    lot: &'a Lot,
    #[serde(skip_serializing_if = "Option::is_none")]
    valuation: Option<&'a OpenLotValuation>,
}

impl LotsCommand {
    pub fn exec(&self) -> anyhow::Result<()> {
        let ledger = self.input.load_ledger()?;
        let as_of = parse_instant(self.at.as_deref())?;
        let aggregator = ReportAggregator::new(ledger.snapshot(), ledger.resolver()).at(as_of);

        let valuations = aggregator.open_lots();
        let by_reference: HashMap<&str, &OpenLotValuation> = valuations
            .iter()
            .map(|v| (v.reference.as_str(), v))
            .collect();

        // lots as they stood at the instant, not as they are now
        let lots: Vec<Lot> = aggregator
            .snapshot()
            .books()
            .filter(|book| {
                self.asset
                    .as_deref()
                    .map_or(true, |a| book.asset().eq_ignore_ascii_case(a))
            })
            .flat_map(|book| book.lots_at(as_of))
            .filter(|lot| self.all || lot.is_open())
            .collect();

        let views: Vec<LotView> = lots
            .iter()
            .map(|lot| {
                let reference = lot.reference();
                LotView {
                    valuation: by_reference.get(reference.as_str()).copied(),
                    state: lot.state().display(),
                    reference,
                    lot,
                }
            })
            .collect();

        if self.json {
            println!("{}", serde_json::to_string_pretty(&views)?);
            return Ok(());
        }

        if views.is_empty() {
            println!("No lots found matching filters");
            return Ok(());
        }

        let rows: Vec<LotRow> = views.iter().map(LotRow::from).collect();
        println!();
        println!("LOTS");
        println!();
        println!("{}", table(rows));
        Ok(())
    }
}

#[derive(Debug, Tabled)]
struct LotRow {
    #[tabled(rename = "Lot")]
    lot: String,
    #[tabled(rename = "Acquired")]
    acquired: String,
    #[tabled(rename = "Origin")]
    origin: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Original")]
    original: String,
    #[tabled(rename = "Remaining")]
    remaining: String,
    #[tabled(rename = "Unit Cost")]
    unit_cost: String,
    #[tabled(rename = "Value")]
    value: String,
    #[tabled(rename = "Unrealized")]
    unrealized: String,
}

impl From<&LotView<'_>> for LotRow {
    fn from(view: &LotView<'_>) -> Self {
        LotRow {
            lot: view.reference.clone(),
            acquired: view.lot.acquired_at.format("%Y-%m-%d %H:%M").to_string(),
            origin: view.lot.origin.display().to_string(),
            state: view.state.to_string(),
            original: format_quantity(view.lot.original_quantity),
            remaining: format_quantity(view.lot.remaining_quantity),
            unit_cost: format_eur(view.lot.unit_cost_eur),
            value: format_optional_eur(view.valuation.and_then(|v| v.market_value_eur)),
            unrealized: format_optional_eur(view.valuation.and_then(|v| v.unrealized_gain_eur)),
        }
    }
}
