//! Row-level features the evidence methods read off an order.

use serde::{Deserialize, Serialize};

use crate::metrics::{MetricKind, OrderRecord};

/// Every feature a hypothesis may implicate. Values are extracted per
/// order; `None` means the feature is undefined for that row (an ETA error
/// before delivery, a missing rating) and the row drops out of that
/// feature's sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureId {
    BasketValue,
    Distance,
    MerchantPrep,
    CourierWait,
    Batched,
    Substituted,
    MissingItem,
    RefundAmount,
    ItemCount,
    SupportTicket,
    Rating,
    EtaError,
}

impl FeatureId {
    pub const ALL: [FeatureId; 12] = [
        FeatureId::BasketValue,
        FeatureId::Distance,
        FeatureId::MerchantPrep,
        FeatureId::CourierWait,
        FeatureId::Batched,
        FeatureId::Substituted,
        FeatureId::MissingItem,
        FeatureId::RefundAmount,
        FeatureId::ItemCount,
        FeatureId::SupportTicket,
        FeatureId::Rating,
        FeatureId::EtaError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureId::BasketValue => "basket_value",
            FeatureId::Distance => "distance",
            FeatureId::MerchantPrep => "merchant_prep",
            FeatureId::CourierWait => "courier_wait",
            FeatureId::Batched => "batched",
            FeatureId::Substituted => "substituted",
            FeatureId::MissingItem => "missing_item",
            FeatureId::RefundAmount => "refund_amount",
            FeatureId::ItemCount => "item_count",
            FeatureId::SupportTicket => "support_ticket",
            FeatureId::Rating => "rating",
            FeatureId::EtaError => "eta_error",
        }
    }

    /// Extract this feature's value from one order.
    pub fn value(&self, o: &OrderRecord) -> Option<f64> {
        match self {
            FeatureId::BasketValue => Some(o.basket_value),
            FeatureId::Distance => Some(o.distance_miles),
            FeatureId::MerchantPrep => Some(o.merchant_prep_secs),
            FeatureId::CourierWait => Some(o.courier_wait_secs),
            FeatureId::Batched => Some(if o.batched { 1.0 } else { 0.0 }),
            FeatureId::Substituted => Some(if o.substituted_items > 0 { 1.0 } else { 0.0 }),
            FeatureId::MissingItem => Some(if o.missing_items > 0 { 1.0 } else { 0.0 }),
            FeatureId::RefundAmount => Some(o.refund_amount),
            FeatureId::ItemCount => Some(f64::from(o.items)),
            FeatureId::SupportTicket => Some(f64::from(o.support_tickets)),
            FeatureId::Rating => o.rating.map(f64::from),
            FeatureId::EtaError => o.eta_error_minutes(),
        }
    }
}

impl std::fmt::Display for FeatureId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The binary outcome the attribution classifier predicts for a metric.
/// Undelivered orders count as not-late, matching the rate definitions.
pub fn outcome_label(metric: MetricKind, o: &OrderRecord) -> f64 {
    let hit = match metric {
        MetricKind::CxScore | MetricKind::OnTimeRate => o.is_late(),
        MetricKind::CancellationRate => o.canceled,
        MetricKind::RefundRate => o.has_refund(),
        MetricKind::ItemAccuracy => o.item_issue(),
        MetricKind::SupportRate => o.support_tickets > 0,
        MetricKind::RatingScore => o.rating.map(|r| r <= 2).unwrap_or(false),
    };
    if hit {
        1.0
    } else {
        0.0
    }
}

/// Mean of a feature over the rows where it is defined. None when no row
/// defines it.
pub fn mean_feature(rows: &[OrderRecord], feature: FeatureId) -> Option<f64> {
    let values: Vec<f64> = rows.iter().filter_map(|o| feature.value(o)).collect();
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}
