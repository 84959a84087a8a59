use crate::tax::de::{TaxRules, TaxYear};
use crate::tax::ledger::{DisposalKind, DisposalMatch};
use crate::tax::lot::{lot_reference, LotId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

/// One matched lot of a disposal, classified under the Spekulationsfrist
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaxEvent {
    pub source_id: String,
    pub asset: String,
    pub kind: DisposalKind,
    pub lot_id: LotId,
    pub lot_reference: String,
    pub acquired_at: DateTime<Utc>,
    pub disposed_at: DateTime<Utc>,
    pub quantity: Decimal,
    pub cost_eur: Decimal,
    pub proceeds_eur: Decimal,
    pub fee_eur: Decimal,
    /// Proceeds less cost less fee, signed
    pub gain_eur: Decimal,
    pub holding_days: i64,
    pub is_taxable: bool,
    pub tax_year: TaxYear,
}

/// Classify a disposal with the default German rules
pub fn classify(disposal: &DisposalMatch) -> Vec<TaxEvent> {
    classify_with(disposal, &TaxRules::default())
}

pub fn classify_with(disposal: &DisposalMatch, rules: &TaxRules) -> Vec<TaxEvent> {
    let tax_year = TaxYear::from_datetime(disposal.disposed_at);

    disposal
        .entries
        .iter()
        .map(|entry| {
            let cost_eur = entry.cost_eur;
            let proceeds_eur = entry.quantity_consumed * entry.unit_proceeds_eur;
            let gain_eur = proceeds_eur - cost_eur - entry.allocated_fee_eur;
            let is_taxable = rules.is_taxable(entry.holding_days);

            log::debug!(
                "{} {}: held {} days, gain={}, taxable={}",
                disposal.source_id,
                lot_reference(&disposal.asset, entry.lot_id),
                entry.holding_days,
                gain_eur,
                is_taxable
            );

            TaxEvent {
                source_id: disposal.source_id.clone(),
                asset: disposal.asset.clone(),
                kind: disposal.kind,
                lot_id: entry.lot_id,
                lot_reference: lot_reference(&disposal.asset, entry.lot_id),
                acquired_at: entry.acquired_at,
                disposed_at: disposal.disposed_at,
                quantity: entry.quantity_consumed,
                cost_eur,
                proceeds_eur,
                fee_eur: entry.allocated_fee_eur,
                gain_eur,
                holding_days: entry.holding_days,
                is_taxable,
                tax_year,
            }
        })
        .collect()
}
