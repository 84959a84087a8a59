//! EUR price lookup.
//!
//! The ledger and the report aggregator never fetch prices themselves; they
//! are handed a [`PriceResolver`]. [`PriceHistory`] is the file-backed
//! implementation used by the CLI, and any closure with the right signature
//! works as a stub in tests.

use crate::transaction::{normalize_asset, parse_datetime};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;

/// The quote currency every price is expressed in
pub const EUR: &str = "EUR";

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[error("no EUR price for {asset} at {at}")]
pub struct PriceUnavailable {
    pub asset: String,
    pub at: DateTime<Utc>,
}

impl PriceUnavailable {
    pub fn new(asset: &str, at: DateTime<Utc>) -> Self {
        PriceUnavailable {
            asset: asset.to_string(),
            at,
        }
    }
}

/// Resolves the EUR value of one unit of an asset at an instant.
///
/// Implementations must be idempotent and free of side effects visible to
/// the caller. They may block (e.g. on network I/O); callers never hold a
/// lock while waiting on them.
pub trait PriceResolver: Send + Sync {
    fn price_at(&self, asset: &str, at: DateTime<Utc>) -> Result<Decimal, PriceUnavailable>;
}

impl<F> PriceResolver for F
where
    F: Fn(&str, DateTime<Utc>) -> Result<Decimal, PriceUnavailable> + Send + Sync,
{
    fn price_at(&self, asset: &str, at: DateTime<Utc>) -> Result<Decimal, PriceUnavailable> {
        self(asset, at)
    }
}

/// Resolve a price, answering EUR itself without asking the resolver
pub fn resolve<P>(resolver: &P, asset: &str, at: DateTime<Utc>) -> Result<Decimal, PriceUnavailable>
where
    P: PriceResolver + ?Sized,
{
    if asset.eq_ignore_ascii_case(EUR) {
        return Ok(Decimal::ONE);
    }
    resolver.price_at(asset, at)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub price_eur: Decimal,
}

#[derive(Debug, Deserialize)]
struct PriceRecord {
    asset: String,
    timestamp: String,
    price_eur: Decimal,
}

/// Historical EUR prices per asset.
///
/// A lookup answers with the latest point at or before the requested instant,
/// as long as that point is not older than `max_age`.
#[derive(Debug, Clone)]
pub struct PriceHistory {
    points: HashMap<String, Vec<PricePoint>>,
    max_age: Duration,
}

impl Default for PriceHistory {
    fn default() -> Self {
        PriceHistory {
            points: HashMap::new(),
            max_age: Duration::days(1),
        }
    }
}

impl PriceHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn insert(&mut self, asset: &str, timestamp: DateTime<Utc>, price_eur: Decimal) {
        let points = self.points.entry(normalize_asset(asset)).or_default();
        let point = PricePoint {
            timestamp,
            price_eur,
        };
        match points.binary_search_by_key(&timestamp, |p| p.timestamp) {
            Ok(index) => points[index] = point,
            Err(index) => points.insert(index, point),
        }
    }

    pub fn len(&self) -> usize {
        self.points.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read `asset,timestamp,price_eur` records
    pub fn read_csv<R: Read>(reader: R) -> anyhow::Result<Self> {
        let mut history = PriceHistory::new();
        history.extend_from_csv(reader)?;
        Ok(history)
    }

    pub fn extend_from_csv<R: Read>(&mut self, reader: R) -> anyhow::Result<()> {
        let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        for record in rdr.deserialize::<PriceRecord>() {
            let record = record?;
            if record.price_eur < Decimal::ZERO {
                anyhow::bail!(
                    "negative price for {} at {}: {}",
                    record.asset,
                    record.timestamp,
                    record.price_eur
                );
            }
            let timestamp = parse_datetime(&record.timestamp)?;
            self.insert(&record.asset, timestamp, record.price_eur);
        }
        log::debug!("Loaded {} price points", self.len());
        Ok(())
    }
}

impl PriceResolver for PriceHistory {
    fn price_at(&self, asset: &str, at: DateTime<Utc>) -> Result<Decimal, PriceUnavailable> {
        let points = self
            .points
            .get(&normalize_asset(asset))
            .ok_or_else(|| PriceUnavailable::new(asset, at))?;

        let index = points.partition_point(|p| p.timestamp <= at);
        match index.checked_sub(1).map(|i| points[i]) {
            Some(point) if at - point.timestamp <= self.max_age => Ok(point.price_eur),
            _ => Err(PriceUnavailable::new(asset, at)),
        }
    }
}
