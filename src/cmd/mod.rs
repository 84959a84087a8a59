pub mod lots;
pub mod report;
pub mod schema;
pub mod standings;
pub mod validate;
pub mod value;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use clap::Args;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use steuerc::prices::PriceHistory;
use steuerc::tax::Ledger;
use steuerc::transaction::{self, Transaction};
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};

/// Where transactions and prices are read from
#[derive(Args, Debug)]
pub struct InputArgs {
    /// Transactions file (CSV or JSON) or a directory of them. Reads from stdin with "-".
    #[arg(short, long, env = "RAW_TRANSACTIONS_PATH", default_value = "-")]
    pub transactions: PathBuf,

    /// Price history CSV with asset,timestamp,price_eur columns
    #[arg(short, long, env = "PRICES_PATH")]
    pub prices: Option<PathBuf>,

    /// Oldest price point accepted for a lookup, in hours
    #[arg(long, default_value_t = 24)]
    pub max_price_age: i64,
}

impl InputArgs {
    /// Transactions checked for unique ids and sorted for ingestion
    pub fn read_transactions(&self) -> anyhow::Result<Vec<Transaction>> {
        let mut transactions = load_transactions(&self.transactions)?;
        transaction::check_unique_ids(&transactions)?;
        transaction::sort_transactions(&mut transactions);
        Ok(transactions)
    }

    pub fn read_prices(&self) -> anyhow::Result<PriceHistory> {
        if self.max_price_age < 0 {
            anyhow::bail!("--max-price-age must not be negative, got {}", self.max_price_age);
        }
        let max_age = Duration::try_hours(self.max_price_age).ok_or_else(|| {
            anyhow::anyhow!("--max-price-age {} hours is out of range", self.max_price_age)
        })?;
        let mut history = PriceHistory::new().with_max_age(max_age);
        if let Some(path) = &self.prices {
            let file = File::open(path)
                .with_context(|| format!("Failed to open prices {}", path.display()))?;
            history
                .extend_from_csv(BufReader::new(file))
                .with_context(|| format!("Failed to read prices {}", path.display()))?;
        } else {
            log::info!("No price history given, only transaction prices are available");
        }
        Ok(history)
    }

    /// Ledger with every transaction ingested
    pub fn load_ledger(&self) -> anyhow::Result<Ledger<PriceHistory>> {
        let transactions = self.read_transactions()?;
        let ledger = Ledger::new(self.read_prices()?);
        for tx in &transactions {
            ledger
                .ingest(tx)
                .with_context(|| format!("Failed to ingest transaction {}", tx.source_id))?;
        }
        log::info!("Ingested {} transactions", transactions.len());
        Ok(ledger)
    }
}

/// Read transactions from a file, every CSV/JSON file below a directory, or
/// stdin with "-"
pub fn load_transactions(path: &Path) -> anyhow::Result<Vec<Transaction>> {
    if path.as_os_str() == "-" {
        return read_from_stdin();
    }

    let mut files = Vec::new();
    if path.is_dir() {
        collect_input_files(path, &mut files)?;
        files.sort();
        if files.is_empty() {
            anyhow::bail!("No CSV or JSON files found in {}", path.display());
        }
    } else {
        files.push(path.to_path_buf());
    }

    let mut transactions = Vec::new();
    for file in files {
        log::debug!("Reading transactions from {}", file.display());
        transactions.extend(read_from_file(&file)?);
    }
    Ok(transactions)
}

fn collect_input_files(dir: &Path, files: &mut Vec<PathBuf>) -> anyhow::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_input_files(&path, files)?;
        } else if is_json(&path) || is_csv(&path) {
            files.push(path);
        }
    }
    Ok(())
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

fn is_csv(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"))
}

fn read_from_file(path: &Path) -> anyhow::Result<Vec<Transaction>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let reader = BufReader::new(file);
    let transactions = if is_json(path) {
        transaction::read_json(reader)
    } else {
        transaction::read_csv(reader)
    };
    transactions.with_context(|| format!("Failed to read transactions from {}", path.display()))
}

fn read_from_stdin() -> anyhow::Result<Vec<Transaction>> {
    let stdin = io::stdin();
    let mut reader = BufReader::new(stdin.lock());

    let mut buffer = Vec::new();
    reader.read_to_end(&mut buffer)?;

    if buffer.is_empty() {
        anyhow::bail!("No input received. Provide a file or pipe data to stdin.");
    }

    let looks_like_json = buffer
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'{');
    let cursor = io::Cursor::new(buffer);
    if looks_like_json {
        transaction::read_json(cursor)
    } else {
        transaction::read_csv(cursor)
    }
}

/// Parse an instant given on the command line, `now` when absent
pub fn parse_instant(value: Option<&str>) -> anyhow::Result<DateTime<Utc>> {
    match value {
        Some(s) => Ok(transaction::parse_datetime(s)?),
        None => Ok(Utc::now()),
    }
}

/// Rounded table with right-aligned cells
pub fn table<T: Tabled>(rows: Vec<T>) -> String {
    Table::new(rows)
        .with(Style::rounded())
        .with(Modify::new(Rows::new(1..)).with(Alignment::right()))
        .to_string()
}

pub fn yes_no(value: bool) -> String {
    let s = if value { "yes" } else { "no" };
    s.to_string()
}
