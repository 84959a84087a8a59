use clap::{Parser, Subcommand};

mod cmd;

#[derive(Parser, Debug)]
#[command(
    name = "steuerc",
    version,
    about = "German tax report for crypto capital gains and income"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Tax report for one or all tax years
    Report(cmd::report::ReportCommand),
    /// Lots with state, cost basis and unrealized gain
    Lots(cmd::lots::LotsCommand),
    /// Portfolio value at an instant or over a range
    Value(cmd::value::ValueCommand),
    /// Holdings, invested capital and return per asset
    Standings(cmd::standings::StandingsCommand),
    /// Check transactions for problems without building a report
    Validate(cmd::validate::ValidateCommand),
    /// Print the transaction input format
    Schema(cmd::schema::SchemaCommand),
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    pretty_env_logger::init();

    let cli = Cli::parse();
    match cli.command {
        Command::Report(report) => report.exec(),
        Command::Lots(lots) => lots.exec(),
        Command::Value(value) => value.exec(),
        Command::Standings(standings) => standings.exec(),
        Command::Validate(validate) => validate.exec(),
        Command::Schema(schema) => schema.exec(),
    }
}
