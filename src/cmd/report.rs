//! Report command - tax report per calendar year

use crate::cmd::{parse_instant, table, yes_no, InputArgs};
use clap::Args;
use rust_decimal::Decimal;
use serde::Serialize;
use std::io;
use steuerc::tax::de::{FREIGRENZE_EUR, INCOME_FREIGRENZE_EUR};
use steuerc::tax::{ReportAggregator, TaxEvent, TaxReport, TaxRules, TaxYear};
use steuerc::utils::{format_eur, format_optional_eur, format_quantity, round_cents, write_csv};
use tabled::Tabled;

#[derive(Args, Debug)]
pub struct ReportCommand {
    #[command(flatten)]
    input: InputArgs,

    /// Tax year to report (e.g., 2024). Every year with activity if not specified.
    #[arg(short, long, env = "TAX_YEAR")]
    year: Option<i32>,

    /// Taxpayer name shown in the report header
    #[arg(short, long, env = "FULL_NAME")]
    name: Option<String>,

    /// Freigrenze for private sales in EUR
    #[arg(long, default_value_t = FREIGRENZE_EUR)]
    freigrenze: Decimal,

    /// Freigrenze for other income (rewards) in EUR
    #[arg(long, default_value_t = INCOME_FREIGRENZE_EUR)]
    income_freigrenze: Decimal,

    /// Instant open lots are valued at. Defaults to now.
    #[arg(long)]
    at: Option<String>,

    /// Output as JSON instead of formatted text
    #[arg(long)]
    json: bool,

    /// Output tax events as CSV
    #[arg(long, conflicts_with = "json")]
    csv: bool,
}

#[derive(Debug, Serialize)]
struct ReportOutput<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    reports: &'a [TaxReport],
}

impl ReportCommand {
    pub fn exec(&self) -> anyhow::Result<()> {
        let ledger = self.input.load_ledger()?;
        let rules = TaxRules::default()
            .with_freigrenze(self.freigrenze)
            .with_income_freigrenze(self.income_freigrenze);
        let aggregator = ReportAggregator::new(ledger.snapshot(), ledger.resolver())
            .with_rules(rules)
            .at(parse_instant(self.at.as_deref())?);

        let years = match self.year {
            Some(year) => vec![TaxYear(year)],
            None => aggregator.years(),
        };
        let reports: Vec<TaxReport> = years.into_iter().map(|y| aggregator.build_report(y)).collect();

        if self.json {
            let output = ReportOutput {
                name: self.name.as_deref(),
                reports: &reports,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        } else if self.csv {
            let records = reports
                .iter()
                .flat_map(|r| r.events.iter())
                .map(TaxEventRecord::from);
            write_csv(records, io::stdout())?;
        } else if reports.is_empty() {
            println!("No disposals or income found");
        } else {
            for report in &reports {
                self.print_report(report);
            }
        }
        Ok(())
    }

    fn print_report(&self, report: &TaxReport) {
        println!();
        match &self.name {
            Some(name) => println!("TAX REPORT {} - {}", report.tax_year, name),
            None => println!("TAX REPORT {}", report.tax_year),
        }
        println!();

        println!("PRIVATE SALES (§23 EStG)");
        if report.events.is_empty() {
            println!("  No disposals");
        } else {
            let rows: Vec<EventRow> = report.events.iter().map(EventRow::from).collect();
            println!("{}", table(rows));
        }
        println!(
            "  Taxable: {} disposals | Proceeds: {} | Costs: {} | Fees: {}",
            report.taxable_events().count(),
            format_eur(report.taxable_proceeds_eur),
            format_eur(report.taxable_cost_eur),
            format_eur(report.taxable_fees_eur)
        );
        println!(
            "  Net gain: {} | Freigrenze: {}{}",
            format_eur(report.net_taxable_gain_eur),
            format_eur(report.rules.freigrenze_eur),
            if report.below_freigrenze {
                " (not reached)"
            } else {
                ""
            }
        );
        if report.taxable_gain_eur < Decimal::ZERO {
            println!(
                "  Taxable gain: {} (loss to offset)",
                format_eur(report.taxable_gain_eur)
            );
        } else {
            println!("  Taxable gain: {}", format_eur(report.taxable_gain_eur));
        }
        println!(
            "  Exempt gain (held over {} days): {}",
            report.rules.speculation_period_days,
            format_eur(report.exempt_gain_eur)
        );
        println!();

        println!("OTHER INCOME (§22 Nr. 3 EStG)");
        println!(
            "  Rewards: {} | Total: {} | Freigrenze: {}{}",
            report.income.events.len(),
            format_eur(report.income.total_eur),
            format_eur(report.rules.income_freigrenze_eur),
            if report.income.below_freigrenze {
                " (not reached)"
            } else {
                ""
            }
        );
        println!();

        println!(
            "OPEN LOTS (valued at {})",
            report.report_time.format("%Y-%m-%d %H:%M:%S")
        );
        if report.open_lots.is_empty() {
            println!("  No open lots");
        } else {
            let rows: Vec<OpenLotRow> = report
                .open_lots
                .iter()
                .map(|l| OpenLotRow {
                    lot: l.reference.clone(),
                    acquired: l.lot.acquired_at.format("%Y-%m-%d").to_string(),
                    remaining: format_quantity(l.lot.remaining_quantity),
                    cost_basis: format_eur(l.cost_basis_eur),
                    value: format_optional_eur(l.market_value_eur),
                    unrealized: format_optional_eur(l.unrealized_gain_eur),
                    days: l.holding_days.to_string(),
                    taxable: yes_no(l.would_be_taxable),
                })
                .collect();
            println!("{}", table(rows));
        }
        println!();
    }
}

#[derive(Debug, Tabled)]
struct EventRow {
    #[tabled(rename = "Disposed")]
    disposed: String,
    #[tabled(rename = "Id")]
    source_id: String,
    #[tabled(rename = "Lot")]
    lot: String,
    #[tabled(rename = "Acquired")]
    acquired: String,
    #[tabled(rename = "Days")]
    days: String,
    #[tabled(rename = "Quantity")]
    quantity: String,
    #[tabled(rename = "Proceeds")]
    proceeds: String,
    #[tabled(rename = "Cost")]
    cost: String,
    #[tabled(rename = "Fee")]
    fee: String,
    #[tabled(rename = "Gain")]
    gain: String,
    #[tabled(rename = "Taxable")]
    taxable: String,
}

impl From<&TaxEvent> for EventRow {
    fn from(e: &TaxEvent) -> Self {
        EventRow {
            disposed: e.disposed_at.format("%Y-%m-%d").to_string(),
            source_id: e.source_id.clone(),
            lot: e.lot_reference.clone(),
            acquired: e.acquired_at.format("%Y-%m-%d").to_string(),
            days: e.holding_days.to_string(),
            quantity: format_quantity(e.quantity),
            proceeds: format_eur(e.proceeds_eur),
            cost: format_eur(e.cost_eur),
            fee: format_eur(e.fee_eur),
            gain: format_eur(e.gain_eur),
            taxable: yes_no(e.is_taxable),
        }
    }
}

#[derive(Debug, Tabled)]
struct OpenLotRow {
    #[tabled(rename = "Lot")]
    lot: String,
    #[tabled(rename = "Acquired")]
    acquired: String,
    #[tabled(rename = "Remaining")]
    remaining: String,
    #[tabled(rename = "Cost Basis")]
    cost_basis: String,
    #[tabled(rename = "Value")]
    value: String,
    #[tabled(rename = "Unrealized")]
    unrealized: String,
    #[tabled(rename = "Days")]
    days: String,
    #[tabled(rename = "Taxable If Sold")]
    taxable: String,
}

/// CSV record for tax event output
#[derive(Debug, Serialize)]
struct TaxEventRecord {
    tax_year: i32,
    source_id: String,
    kind: String,
    asset: String,
    lot: String,
    acquired_at: String,
    disposed_at: String,
    holding_days: i64,
    quantity: String,
    cost_eur: String,
    proceeds_eur: String,
    fee_eur: String,
    gain_eur: String,
    taxable: bool,
}

impl From<&TaxEvent> for TaxEventRecord {
    fn from(e: &TaxEvent) -> Self {
        TaxEventRecord {
            tax_year: e.tax_year.0,
            source_id: e.source_id.clone(),
            kind: e.kind.display().to_string(),
            asset: e.asset.clone(),
            lot: e.lot_reference.clone(),
            acquired_at: e.acquired_at.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            disposed_at: e.disposed_at.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            holding_days: e.holding_days,
            quantity: e.quantity.to_string(),
            cost_eur: round_cents(e.cost_eur).to_string(),
            proceeds_eur: round_cents(e.proceeds_eur).to_string(),
            fee_eur: round_cents(e.fee_eur).to_string(),
            gain_eur: round_cents(e.gain_eur).to_string(),
            taxable: e.is_taxable,
        }
    }
}
