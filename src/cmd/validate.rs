//! Validate command - surface data quality issues without generating reports

use crate::cmd::{load_transactions, InputArgs};
use clap::Args;
use serde::Serialize;
use std::collections::HashSet;
use steuerc::tax::{Ledger, LedgerError};
use steuerc::transaction::{self, Transaction};

#[derive(Args, Debug)]
pub struct ValidateCommand {
    #[command(flatten)]
    input: InputArgs,

    /// Output as JSON instead of formatted text
    #[arg(long)]
    json: bool,
}

/// A validation issue for output
#[derive(Debug, Clone, Serialize)]
struct ValidationIssue {
    #[serde(rename = "type")]
    issue_type: String,
    source_id: String,
    timestamp: String,
    asset: String,
    message: String,
}

impl ValidationIssue {
    fn new(issue_type: &str, tx: &Transaction, message: String) -> Self {
        ValidationIssue {
            issue_type: issue_type.to_string(),
            source_id: tx.source_id.clone(),
            timestamp: tx.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            asset: tx.asset.clone(),
            message,
        }
    }
}

/// JSON output structure
#[derive(Debug, Serialize)]
struct ValidationOutput {
    transaction_count: usize,
    issue_count: usize,
    issues: Vec<ValidationIssue>,
}

impl ValidateCommand {
    pub fn exec(&self) -> anyhow::Result<()> {
        let mut transactions = load_transactions(&self.input.transactions)?;
        let mut issues = duplicate_ids(&transactions);
        transaction::sort_transactions(&mut transactions);

        let ledger = Ledger::new(self.input.read_prices()?);
        for tx in &transactions {
            if let Err(err) = ledger.ingest(tx) {
                issues.push(ValidationIssue::new(error_type_name(&err), tx, err.to_string()));
            }
        }

        for book in ledger.snapshot().books() {
            if !book.is_conserved() {
                issues.push(ValidationIssue {
                    issue_type: "QuantityMismatch".to_string(),
                    source_id: String::new(),
                    timestamp: String::new(),
                    asset: book.asset().to_string(),
                    message: format!(
                        "open {} + disposed {} + fees {} does not equal acquired {}",
                        book.open_quantity(),
                        book.disposed_quantity(),
                        book.fee_charged_quantity(),
                        book.acquired_quantity()
                    ),
                });
            }
            if !book.pending_debit().is_zero() {
                log::warn!(
                    "{}: {} of fees still waiting for a lot",
                    book.asset(),
                    book.pending_debit()
                );
            }
        }

        if self.json {
            let output = ValidationOutput {
                transaction_count: transactions.len(),
                issue_count: issues.len(),
                issues: issues.clone(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        } else {
            print_text(&issues, transactions.len());
        }

        // Exit with code 1 if issues found
        if !issues.is_empty() {
            std::process::exit(1);
        }
        Ok(())
    }
}

fn duplicate_ids(transactions: &[Transaction]) -> Vec<ValidationIssue> {
    let mut seen = HashSet::new();
    transactions
        .iter()
        .filter(|tx| !seen.insert(tx.source_id.as_str()))
        .map(|tx| {
            ValidationIssue::new(
                "DuplicateSourceId",
                tx,
                format!("source id {} appears more than once", tx.source_id),
            )
        })
        .collect()
}

fn error_type_name(err: &LedgerError) -> &'static str {
    match err {
        LedgerError::PriceUnavailable(_) => "PriceUnavailable",
        LedgerError::InsufficientLots { .. } => "InsufficientLots",
        LedgerError::OrphanedFee { .. } => "OrphanedFee",
        LedgerError::NonMonotonicTimestamp { .. } => "NonMonotonicTimestamp",
        LedgerError::InvalidTransaction(_) => "InvalidTransaction",
    }
}

fn print_text(issues: &[ValidationIssue], transaction_count: usize) {
    println!();
    println!("VALIDATION RESULTS ({} transactions)", transaction_count);
    println!();

    if issues.is_empty() {
        println!("\u{2713} No issues found.");
        return;
    }

    println!("\u{26A0} {} issue(s) found:", issues.len());
    println!();
    for (i, issue) in issues.iter().enumerate() {
        if issue.source_id.is_empty() {
            println!("  {}. [{}] {}", i + 1, issue.issue_type, issue.asset);
        } else {
            println!(
                "  {}. [{}] {} {} {}",
                i + 1,
                issue.issue_type,
                issue.timestamp,
                issue.source_id,
                issue.asset
            );
        }
        println!("     {}", issue.message);
        println!();
    }
}
