//! Schema command - print expected input formats

use clap::Args;
use schemars::schema_for;
use steuerc::transaction::TransactionInput;

#[derive(Args, Debug)]
pub struct SchemaCommand {
    /// Output format: json-schema, csv-header or csv-fields
    #[arg(value_enum, default_value = "json-schema")]
    format: SchemaFormat,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum SchemaFormat {
    /// JSON Schema for the transaction input
    JsonSchema,
    /// CSV header row with column names
    CsvHeader,
    /// CSV column descriptions
    CsvFields,
    /// CSV header row of the price history
    PricesHeader,
}

impl SchemaCommand {
    pub fn exec(&self) -> anyhow::Result<()> {
        match self.format {
            SchemaFormat::JsonSchema => {
                let schema = schema_for!(TransactionInput);
                println!("{}", serde_json::to_string_pretty(&schema)?);
            }
            SchemaFormat::CsvHeader => {
                let columns: Vec<&str> = CSV_FIELDS.iter().map(|(name, _, _)| *name).collect();
                println!("{}", columns.join(","));
            }
            SchemaFormat::CsvFields => print_csv_fields(),
            SchemaFormat::PricesHeader => println!("asset,timestamp,price_eur"),
        }
        Ok(())
    }
}

fn print_csv_fields() {
    println!("CSV Input Format");
    println!("================");
    println!();
    for (name, required, description) in CSV_FIELDS {
        let req = if *required { "required" } else { "optional" };
        println!("{:16} ({:8})  {}", name, req, description);
    }
    println!();
    println!("All prices and EUR fees are in EUR. Timestamps without offset are UTC.");
}

const CSV_FIELDS: &[(&str, bool, &str)] = &[
    (
        "source_id",
        true,
        "Unique identifier, also breaks ties between equal timestamps",
    ),
    (
        "timestamp",
        true,
        "RFC3339, YYYY-MM-DD HH:MM:SS or YYYY-MM-DD",
    ),
    (
        "kind",
        true,
        "acquisition, disposal, transfer-in, transfer-out, reward or fee",
    ),
    ("asset", true, "Asset symbol (e.g., BTC, ETH)"),
    ("quantity", true, "Positive amount of the asset"),
    (
        "unit_price_eur",
        false,
        "EUR price per unit, looked up in the price history if empty",
    ),
    ("fee", false, "Fee amount"),
    (
        "fee_currency",
        false,
        "EUR (default) or ASSET for a fee paid in the asset itself",
    ),
    ("description", false, "Optional description"),
];
