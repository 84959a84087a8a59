//! Value command - portfolio value at an instant or over time

use crate::cmd::{parse_instant, table, InputArgs};
use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use clap::Args;
use steuerc::tax::{PortfolioValue, ReportAggregator};
use steuerc::transaction::parse_datetime;
use steuerc::utils::{format_eur, format_quantity};
use tabled::Tabled;

#[derive(Args, Debug)]
pub struct ValueCommand {
    #[command(flatten)]
    input: InputArgs,

    /// Instant to value the portfolio at. Defaults to now.
    #[arg(long, conflicts_with = "from")]
    at: Option<String>,

    /// Start of a valuation series
    #[arg(long, requires = "to")]
    from: Option<String>,

    /// End of a valuation series (inclusive)
    #[arg(long, requires = "from")]
    to: Option<String>,

    /// Days between points of a valuation series
    #[arg(long, default_value_t = 1)]
    every: i64,

    /// Output as JSON instead of formatted table
    #[arg(long)]
    json: bool,
}

impl ValueCommand {
    pub fn exec(&self) -> anyhow::Result<()> {
        let ledger = self.input.load_ledger()?;
        let aggregator = ReportAggregator::new(ledger.snapshot(), ledger.resolver());

        match (&self.from, &self.to) {
            (Some(from), Some(to)) => {
                let points = self.series_points(from, to)?;
                let series = aggregator
                    .valuation_series(points)
                    .context("Failed to value portfolio")?;
                if self.json {
                    println!("{}", serde_json::to_string_pretty(&series)?);
                } else {
                    print_series(&series);
                }
            }
            _ => {
                let as_of = parse_instant(self.at.as_deref())?;
                let value = aggregator
                    .portfolio_value(as_of)
                    .context("Failed to value portfolio")?;
                if self.json {
                    println!("{}", serde_json::to_string_pretty(&value)?);
                } else {
                    print_value(&value);
                }
            }
        }
        Ok(())
    }

    fn series_points(&self, from: &str, to: &str) -> anyhow::Result<Vec<DateTime<Utc>>> {
        if self.every <= 0 {
            anyhow::bail!("--every must be at least 1 day");
        }
        let from = parse_datetime(from)?;
        let to = parse_datetime(to)?;
        if to < from {
            anyhow::bail!("--to {} is before --from {}", to, from);
        }

        let step = Duration::try_days(self.every)
            .ok_or_else(|| anyhow::anyhow!("--every {} days is out of range", self.every))?;
        let mut points = Vec::new();
        let mut next = Some(from);
        while let Some(point) = next.filter(|p| *p <= to) {
            points.push(point);
            next = point.checked_add_signed(step);
        }
        Ok(points)
    }
}

#[derive(Debug, Tabled)]
struct AssetRow {
    #[tabled(rename = "Asset")]
    asset: String,
    #[tabled(rename = "Quantity")]
    quantity: String,
    #[tabled(rename = "Price")]
    price: String,
    #[tabled(rename = "Value")]
    value: String,
    #[tabled(rename = "Cost Basis")]
    cost_basis: String,
}

#[derive(Debug, Tabled)]
struct SeriesRow {
    #[tabled(rename = "Date")]
    date: String,
    #[tabled(rename = "Value")]
    value: String,
    #[tabled(rename = "Cost Basis")]
    cost_basis: String,
}

fn print_value(value: &PortfolioValue) {
    println!();
    println!("PORTFOLIO VALUE ({})", value.as_of.format("%Y-%m-%d %H:%M:%S"));
    println!();

    if value.assets.is_empty() {
        println!("No holdings");
        return;
    }

    let rows: Vec<AssetRow> = value
        .assets
        .iter()
        .map(|a| AssetRow {
            asset: a.asset.clone(),
            quantity: format_quantity(a.quantity),
            price: format_eur(a.price_eur),
            value: format_eur(a.value_eur),
            cost_basis: format_eur(a.cost_basis_eur),
        })
        .collect();
    println!("{}", table(rows));
    println!(
        "Total: {} | Cost basis: {}",
        format_eur(value.total_value_eur),
        format_eur(value.total_cost_basis_eur)
    );
}

fn print_series(series: &[PortfolioValue]) {
    println!();
    println!("PORTFOLIO VALUATION");
    println!();

    let rows: Vec<SeriesRow> = series
        .iter()
        .map(|v| SeriesRow {
            date: v.as_of.format("%Y-%m-%d").to_string(),
            value: format_eur(v.total_value_eur),
            cost_basis: format_eur(v.total_cost_basis_eur),
        })
        .collect();
    println!("{}", table(rows));
}
