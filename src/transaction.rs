use chrono::{DateTime, NaiveDate, NaiveDateTime, SubsecRound, Utc};
use rust_decimal::Decimal;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::io::Read;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("duplicate source id: {0}")]
    DuplicateSourceId(String),
    #[error("quantity must be positive: {source_id} has {quantity}")]
    NonPositiveQuantity { source_id: String, quantity: Decimal },
    #[error("fee must not be negative: {source_id} has {amount}")]
    NegativeFee { source_id: String, amount: Decimal },
    #[error("unit price must not be negative: {source_id} has {price}")]
    NegativePrice { source_id: String, price: Decimal },
    #[error("asset symbol is empty: {0}")]
    MissingAsset(String),
    #[error("invalid datetime: {0}")]
    InvalidDatetime(String),
}

/// What a transaction does to the holdings of its asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum TransactionKind {
    #[serde(alias = "buy", alias = "Acquisition")]
    Acquisition,
    #[serde(alias = "sell", alias = "Disposal")]
    Disposal,
    /// Deposit from a wallet that is not tracked
    #[serde(alias = "deposit", alias = "TransferIn")]
    TransferIn,
    /// Withdrawal to a wallet that is not tracked
    #[serde(alias = "withdrawal", alias = "TransferOut")]
    TransferOut,
    /// Staking reward or airdrop
    #[serde(alias = "staking", alias = "airdrop", alias = "Reward")]
    Reward,
    /// Fee paid in the asset itself, e.g. a network withdrawal fee
    #[serde(alias = "Fee")]
    Fee,
}

impl TransactionKind {
    pub fn display(&self) -> &'static str {
        match self {
            TransactionKind::Acquisition => "Acquisition",
            TransactionKind::Disposal => "Disposal",
            TransactionKind::TransferIn => "Transfer In",
            TransactionKind::TransferOut => "Transfer Out",
            TransactionKind::Reward => "Reward",
            TransactionKind::Fee => "Fee",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display())
    }
}

/// Currency a fee is denominated in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum FeeCurrency {
    #[default]
    #[serde(alias = "eur")]
    Eur,
    /// The transaction's own asset
    #[serde(alias = "asset")]
    Asset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Fee {
    pub amount: Decimal,
    pub currency: FeeCurrency,
}

impl Fee {
    pub fn eur(amount: Decimal) -> Self {
        Fee {
            amount,
            currency: FeeCurrency::Eur,
        }
    }

    pub fn in_asset(amount: Decimal) -> Self {
        Fee {
            amount,
            currency: FeeCurrency::Asset,
        }
    }

    /// Fee value in EUR given the EUR price of one unit of the transaction asset
    pub fn to_eur(&self, unit_price_eur: Decimal) -> Decimal {
        match self.currency {
            FeeCurrency::Eur => self.amount,
            FeeCurrency::Asset => self.amount * unit_price_eur,
        }
    }
}

/// Input root for transaction JSON
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TransactionInput {
    pub transactions: Vec<TransactionRecord>,
}

/// Normalized transaction record as read from CSV or JSON
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TransactionRecord {
    /// Unique identifier, used for traceability and to break timestamp ties
    pub source_id: String,
    /// UTC instant (RFC3339, "YYYY-MM-DD HH:MM:SS" or date-only)
    pub timestamp: String,
    pub kind: TransactionKind,
    /// Asset symbol (e.g. "BTC")
    pub asset: String,
    #[schemars(with = "f64")]
    pub quantity: Decimal,
    /// EUR price per unit; resolved from price history when absent
    #[serde(default)]
    #[schemars(with = "Option<f64>")]
    pub unit_price_eur: Option<Decimal>,
    #[serde(default)]
    #[schemars(with = "Option<f64>")]
    pub fee: Option<Decimal>,
    /// "EUR" (default) or "ASSET"
    #[serde(default)]
    pub fee_currency: Option<FeeCurrency>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Canonical transaction consumed by the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transaction {
    pub source_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: TransactionKind,
    pub asset: String,
    pub quantity: Decimal,
    pub unit_price_eur: Option<Decimal>,
    pub fee: Option<Fee>,
    pub description: Option<String>,
}

impl Transaction {
    pub fn new(
        source_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        kind: TransactionKind,
        asset: &str,
        quantity: Decimal,
    ) -> Self {
        Transaction {
            source_id: source_id.into(),
            timestamp: timestamp.trunc_subsecs(0),
            kind,
            asset: normalize_asset(asset),
            quantity,
            unit_price_eur: None,
            fee: None,
            description: None,
        }
    }

    pub fn with_price(mut self, unit_price_eur: Decimal) -> Self {
        self.unit_price_eur = Some(unit_price_eur);
        self
    }

    pub fn with_fee(mut self, fee: Fee) -> Self {
        self.fee = Some(fee);
        self
    }

    /// Ordering key: timestamp first, source id breaks ties
    pub fn sort_key(&self) -> (DateTime<Utc>, &str) {
        (self.timestamp, self.source_id.as_str())
    }

    pub fn validate(&self) -> Result<(), TransactionError> {
        if self.asset.is_empty() {
            return Err(TransactionError::MissingAsset(self.source_id.clone()));
        }
        if self.quantity <= Decimal::ZERO {
            return Err(TransactionError::NonPositiveQuantity {
                source_id: self.source_id.clone(),
                quantity: self.quantity,
            });
        }
        if let Some(fee) = &self.fee {
            if fee.amount < Decimal::ZERO {
                return Err(TransactionError::NegativeFee {
                    source_id: self.source_id.clone(),
                    amount: fee.amount,
                });
            }
        }
        if let Some(price) = self.unit_price_eur {
            if price < Decimal::ZERO {
                return Err(TransactionError::NegativePrice {
                    source_id: self.source_id.clone(),
                    price,
                });
            }
        }
        Ok(())
    }
}

impl TryFrom<TransactionRecord> for Transaction {
    type Error = TransactionError;

    fn try_from(record: TransactionRecord) -> Result<Self, Self::Error> {
        let timestamp = parse_datetime(&record.timestamp)?;
        let fee = record.fee.map(|amount| Fee {
            amount,
            currency: record.fee_currency.unwrap_or_default(),
        });

        let tx = Transaction {
            source_id: record.source_id,
            timestamp,
            kind: record.kind,
            asset: normalize_asset(&record.asset),
            quantity: record.quantity,
            unit_price_eur: record.unit_price_eur,
            fee,
            description: record.description.filter(|d| !d.trim().is_empty()),
        };
        tx.validate()?;
        Ok(tx)
    }
}

/// Read transactions from CSV
pub fn read_csv<R: Read>(reader: R) -> anyhow::Result<Vec<Transaction>> {
    let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut transactions = Vec::new();
    for record in rdr.deserialize::<TransactionRecord>() {
        transactions.push(Transaction::try_from(record?)?);
    }
    Ok(transactions)
}

/// Read transactions from JSON
pub fn read_json<R: Read>(reader: R) -> anyhow::Result<Vec<Transaction>> {
    let input: TransactionInput = serde_json::from_reader(reader)?;
    let transactions = input
        .transactions
        .into_iter()
        .map(Transaction::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(transactions)
}

/// Sort by `(timestamp, source_id)` ascending, the order the ledger expects
pub fn sort_transactions(transactions: &mut [Transaction]) {
    transactions.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
}

pub fn check_unique_ids(transactions: &[Transaction]) -> Result<(), TransactionError> {
    let mut seen = HashSet::new();
    for tx in transactions {
        if !seen.insert(tx.source_id.as_str()) {
            return Err(TransactionError::DuplicateSourceId(tx.source_id.clone()));
        }
    }
    Ok(())
}

pub fn normalize_asset(s: &str) -> String {
    s.trim().to_uppercase()
}

/// Parse an instant; values without offset are taken as UTC and sub-second
/// precision is dropped.
pub fn parse_datetime(s: &str) -> Result<DateTime<Utc>, TransactionError> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc).trunc_subsecs(0));
    }
    for format in [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(dt.and_utc().trunc_subsecs(0));
        }
    }
    if let Some(dt) = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
    {
        return Ok(dt.and_utc());
    }
    Err(TransactionError::InvalidDatetime(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn parse_csv_records() {
        let csv_data = "source_id,timestamp,kind,asset,quantity,unit_price_eur,fee,fee_currency,description
b1,2023-01-10 09:30:00,acquisition,btc,0.5,16000,12.50,EUR,Binance
s1,2023-06-01T12:00:00Z,sell,BTC,0.25,25000,,,
r1,2023-07-01,staking,ETH,0.01,,,,Kraken
f1,2023-07-02 08:00:00.750,fee,ETH,0.001,,,,";

        let txs = read_csv(csv_data.as_bytes()).unwrap();
        assert_eq!(txs.len(), 4);

        assert_eq!(txs[0].kind, TransactionKind::Acquisition);
        assert_eq!(txs[0].asset, "BTC");
        assert_eq!(txs[0].quantity, dec!(0.5));
        assert_eq!(txs[0].unit_price_eur, Some(dec!(16000)));
        assert_eq!(txs[0].fee, Some(Fee::eur(dec!(12.50))));
        assert_eq!(txs[0].description.as_deref(), Some("Binance"));

        assert_eq!(txs[1].kind, TransactionKind::Disposal);
        assert_eq!(txs[1].fee, None);
        assert_eq!(txs[1].description, None);

        assert_eq!(txs[2].kind, TransactionKind::Reward);
        assert_eq!(txs[2].unit_price_eur, None);
        assert_eq!(
            txs[2].timestamp,
            Utc.with_ymd_and_hms(2023, 7, 1, 0, 0, 0).unwrap()
        );

        assert_eq!(txs[3].kind, TransactionKind::Fee);
        assert_eq!(
            txs[3].timestamp,
            Utc.with_ymd_and_hms(2023, 7, 2, 8, 0, 0).unwrap()
        );
    }

    #[test]
    fn parse_json_with_asset_fee() {
        let json_data = r#"{
            "transactions": [
                {
                    "source_id": "w1",
                    "timestamp": "2024-03-01T10:00:00+01:00",
                    "kind": "transfer-out",
                    "asset": "ETH",
                    "quantity": 1.5,
                    "fee": 0.002,
                    "fee_currency": "ASSET"
                }
            ]
        }"#;

        let txs = read_json(json_data.as_bytes()).unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].kind, TransactionKind::TransferOut);
        assert_eq!(txs[0].fee, Some(Fee::in_asset(dec!(0.002))));
        assert_eq!(
            txs[0].timestamp,
            Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
        );
    }

    #[test]
    fn rejects_non_positive_quantity() {
        let csv_data = "source_id,timestamp,kind,asset,quantity,unit_price_eur,fee,fee_currency,description
b1,2023-01-10,acquisition,BTC,0,16000,,,";

        let err = read_csv(csv_data.as_bytes()).unwrap_err();
        let err = err.downcast::<TransactionError>().unwrap();
        assert!(matches!(err, TransactionError::NonPositiveQuantity { .. }));
    }

    #[test]
    fn rejects_invalid_datetime() {
        assert_eq!(
            parse_datetime("10/01/2023"),
            Err(TransactionError::InvalidDatetime("10/01/2023".to_string()))
        );
    }

    #[test]
    fn sorts_by_timestamp_then_source_id() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 1, 2, 12, 0, 0).unwrap();
        let mut txs = vec![
            Transaction::new("c", later, TransactionKind::Disposal, "BTC", dec!(1)),
            Transaction::new("b", t, TransactionKind::Acquisition, "BTC", dec!(1)),
            Transaction::new("a", t, TransactionKind::Acquisition, "BTC", dec!(1)),
        ];
        sort_transactions(&mut txs);
        let ids: Vec<_> = txs.iter().map(|t| t.source_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn duplicate_source_ids_rejected() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let txs = vec![
            Transaction::new("a", t, TransactionKind::Acquisition, "BTC", dec!(1)),
            Transaction::new("a", t, TransactionKind::Acquisition, "ETH", dec!(1)),
        ];
        assert_eq!(
            check_unique_ids(&txs),
            Err(TransactionError::DuplicateSourceId("a".to_string()))
        );
    }

    #[test]
    fn asset_fee_valued_at_unit_price() {
        assert_eq!(Fee::in_asset(dec!(0.001)).to_eur(dec!(30000)), dec!(30));
        assert_eq!(Fee::eur(dec!(2.5)).to_eur(dec!(30000)), dec!(2.5));
    }
}
