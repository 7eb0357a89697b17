//! Static catalog of causal hypotheses.
//!
//! A declarative table, not code branches: each entry names the features it
//! implicates and the evidence methods that can test it. Extending the
//! catalog is a code-time operation; nothing here mutates at runtime.

use serde::{Deserialize, Serialize};

use crate::metrics::MetricKind;
use crate::rca::features::FeatureId;
use crate::rca::RcaError;

/// Which operational domain a hypothesis blames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Supply,
    Merchant,
    Policy,
    Inventory,
    Model,
    External,
    Operational,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Supply => "supply",
            Category::Merchant => "merchant",
            Category::Policy => "policy",
            Category::Inventory => "inventory",
            Category::Model => "model",
            Category::External => "external",
            Category::Operational => "operational",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceMethod {
    Attribution,
    DiffInDiff,
    Correlation,
    Statistical,
}

/// One candidate cause.
#[derive(Debug, Clone, Serialize)]
pub struct Hypothesis {
    pub name: &'static str,
    pub category: Category,
    pub description: &'static str,
    /// Features this cause would move. The first is the primary feature,
    /// used for correlation and for the impact magnitude.
    pub implicated_features: &'static [FeatureId],
    /// Flag splitting treatment from control for diff-in-diff. None means
    /// the method is inapplicable to this hypothesis.
    pub treatment_feature: Option<FeatureId>,
    pub methods: &'static [EvidenceMethod],
}

impl Hypothesis {
    pub fn primary_feature(&self) -> FeatureId {
        self.implicated_features[0]
    }

    pub fn applies(&self, method: EvidenceMethod) -> bool {
        self.methods.contains(&method)
    }

    /// Catalog name with the underscores dropped, for rendered text.
    pub fn label(&self) -> String {
        self.name.replace('_', " ")
    }
}

static CATALOG: [Hypothesis; 7] = [
    Hypothesis {
        name: "courier_availability_drop",
        category: Category::Supply,
        description: "Courier supply fell behind demand, stretching wait and delivery times",
        implicated_features: &[FeatureId::CourierWait, FeatureId::Distance, FeatureId::EtaError],
        treatment_feature: None,
        methods: &[
            EvidenceMethod::Attribution,
            EvidenceMethod::Correlation,
            EvidenceMethod::Statistical,
        ],
    },
    Hypothesis {
        name: "merchant_prep_drift",
        category: Category::Merchant,
        description: "Merchant preparation times drifted upward and ate the promised window",
        implicated_features: &[FeatureId::MerchantPrep, FeatureId::EtaError],
        treatment_feature: None,
        methods: &[
            EvidenceMethod::Attribution,
            EvidenceMethod::Correlation,
            EvidenceMethod::Statistical,
        ],
    },
    Hypothesis {
        name: "batching_policy_change",
        category: Category::Policy,
        description: "A batching policy change added stops ahead of deliveries",
        implicated_features: &[FeatureId::Batched, FeatureId::CourierWait, FeatureId::EtaError],
        treatment_feature: Some(FeatureId::Batched),
        methods: &[
            EvidenceMethod::Attribution,
            EvidenceMethod::DiffInDiff,
            EvidenceMethod::Correlation,
        ],
    },
    Hypothesis {
        name: "stock_availability_drop",
        category: Category::Inventory,
        description: "In-stock availability degraded, driving substitutions and refunds",
        implicated_features: &[
            FeatureId::Substituted,
            FeatureId::MissingItem,
            FeatureId::RefundAmount,
        ],
        treatment_feature: None,
        methods: &[
            EvidenceMethod::Attribution,
            EvidenceMethod::Correlation,
            EvidenceMethod::Statistical,
        ],
    },
    Hypothesis {
        name: "eta_model_bias",
        category: Category::Model,
        description: "The ETA model is systematically over-promising",
        implicated_features: &[FeatureId::EtaError],
        treatment_feature: None,
        methods: &[EvidenceMethod::Correlation, EvidenceMethod::Statistical],
    },
    Hypothesis {
        name: "delivery_radius_creep",
        category: Category::External,
        description: "Delivery radius crept outward, adding distance to every trip",
        implicated_features: &[FeatureId::Distance, FeatureId::EtaError],
        treatment_feature: None,
        methods: &[
            EvidenceMethod::Attribution,
            EvidenceMethod::Correlation,
            EvidenceMethod::Statistical,
        ],
    },
    Hypothesis {
        name: "support_backlog",
        category: Category::Operational,
        description: "A support queue backlog is degrading resolutions and ratings",
        implicated_features: &[FeatureId::SupportTicket, FeatureId::Rating],
        treatment_feature: None,
        methods: &[
            EvidenceMethod::Attribution,
            EvidenceMethod::Correlation,
            EvidenceMethod::Statistical,
        ],
    },
];

pub struct HypothesisLibrary;

impl HypothesisLibrary {
    pub fn all() -> &'static [Hypothesis] {
        &CATALOG
    }

    pub fn get(name: &str) -> Option<&'static Hypothesis> {
        CATALOG.iter().find(|h| h.name == name)
    }

    /// Hypotheses worth testing for a regression in `metric`, in catalog
    /// order. A metric with no mapping is a setup defect and fatal.
    pub fn relevant(metric: MetricKind) -> Result<Vec<&'static Hypothesis>, RcaError> {
        let categories: &[Category] = match metric {
            MetricKind::CxScore => &[
                Category::Supply,
                Category::Merchant,
                Category::Policy,
                Category::Inventory,
                Category::Model,
                Category::External,
                Category::Operational,
            ],
            MetricKind::OnTimeRate => &[
                Category::Supply,
                Category::Merchant,
                Category::Policy,
                Category::Model,
                Category::External,
            ],
            MetricKind::CancellationRate => &[
                Category::Supply,
                Category::Merchant,
                Category::Policy,
                Category::Operational,
            ],
            MetricKind::RefundRate | MetricKind::ItemAccuracy => {
                &[Category::Inventory, Category::Merchant]
            }
            MetricKind::SupportRate => {
                &[Category::Operational, Category::Inventory, Category::Merchant]
            }
            MetricKind::RatingScore => return Err(RcaError::NoHypotheses(metric)),
        };
        Ok(CATALOG
            .iter()
            .filter(|h| categories.contains(&h.category))
            .collect())
    }
}
