//! Standings command - holdings, invested capital and return per asset

use crate::cmd::{parse_instant, table, InputArgs};
use anyhow::Context;
use clap::Args;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use steuerc::tax::{ReportAggregator, Standing};
use steuerc::utils::{format_eur, format_quantity};
use tabled::Tabled;

#[derive(Args, Debug)]
pub struct StandingsCommand {
    #[command(flatten)]
    input: InputArgs,

    /// Instant to value holdings at. Defaults to now.
    #[arg(long)]
    at: Option<String>,

    /// Output as JSON instead of formatted table
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct StandingsOutput {
    standings: Vec<Standing>,
    total_invested_eur: Decimal,
    total_worth_eur: Decimal,
    total_return_ratio: Option<Decimal>,
}

impl StandingsCommand {
    pub fn exec(&self) -> anyhow::Result<()> {
        let ledger = self.input.load_ledger()?;
        let as_of = parse_instant(self.at.as_deref())?;
        let standings = ReportAggregator::new(ledger.snapshot(), ledger.resolver())
            .standings(as_of)
            .context("Failed to value holdings")?;

        let total_invested_eur: Decimal = standings.iter().map(|s| s.invested_eur).sum();
        let total_worth_eur: Decimal = standings.iter().map(|s| s.worth_eur).sum();
        let total_return_ratio = (!total_invested_eur.is_zero())
            .then(|| (total_worth_eur - total_invested_eur) / total_invested_eur);

        if self.json {
            let output = StandingsOutput {
                standings,
                total_invested_eur,
                total_worth_eur,
                total_return_ratio,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
            return Ok(());
        }

        println!();
        println!("PORTFOLIO STANDINGS ({})", as_of.format("%Y-%m-%d %H:%M:%S"));
        println!();

        if standings.is_empty() {
            println!("No holdings");
            return Ok(());
        }

        let rows: Vec<StandingRow> = standings
            .iter()
            .map(|s| StandingRow {
                asset: s.asset.clone(),
                quantity: format_quantity(s.quantity),
                invested: format_eur(s.invested_eur),
                worth: format_eur(s.worth_eur),
                ret: format_return(s.return_ratio),
            })
            .collect();
        println!("{}", table(rows));
        println!(
            "Invested: {} | Worth: {} | Return: {}",
            format_eur(total_invested_eur),
            format_eur(total_worth_eur),
            format_return(total_return_ratio)
        );
        Ok(())
    }
}

#[derive(Debug, Tabled)]
struct StandingRow {
    #[tabled(rename = "Asset")]
    asset: String,
    #[tabled(rename = "Quantity")]
    quantity: String,
    #[tabled(rename = "Invested")]
    invested: String,
    #[tabled(rename = "Worth")]
    worth: String,
    #[tabled(rename = "Return")]
    ret: String,
}

/// Percentage with a direction arrow, e.g. `↑ 12.50%`
fn format_return(ratio: Option<Decimal>) -> String {
    let Some(ratio) = ratio else {
        return "-".to_string();
    };
    let pct = (ratio * dec!(100)).round_dp(2);
    if pct > Decimal::ZERO {
        format!("\u{2191} {:.2}%", pct)
    } else if pct < Decimal::ZERO {
        format!("\u{2193} {:.2}%", pct)
    } else {
        format!("\u{2192} {:.2}%", pct)
    }
}
