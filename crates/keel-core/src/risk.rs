//! Risk indicators, snapshots, and liquidity forecast types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::amount::Amount;

/// Overall risk level, the max severity across indicators.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Normal = 1,
    Elevated = 2,
    High = 3,
    Critical = 4,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "NORMAL"),
            Self::Elevated => write!(f, "ELEVATED"),
            Self::High => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// The closed set of monitored indicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorKind {
    // Liquidity
    L1Ratio,
    L1L2Ratio,
    RedemptionCoverage,
    LiquidityGap7d,
    // Price
    NavVolatility24h,
    AssetPriceDeviation,
    OracleStaleness,
    // Concentration
    SingleAssetConcentration,
    Top3Concentration,
    CounterpartyConcentration,
    // Redemption pressure
    DailyRedemptionRate,
    PendingApprovalRatio,
    RedemptionVelocity7d,
}

impl IndicatorKind {
    pub const ALL: &'static [IndicatorKind] = &[
        IndicatorKind::L1Ratio,
        IndicatorKind::L1L2Ratio,
        IndicatorKind::RedemptionCoverage,
        IndicatorKind::LiquidityGap7d,
        IndicatorKind::NavVolatility24h,
        IndicatorKind::AssetPriceDeviation,
        IndicatorKind::OracleStaleness,
        IndicatorKind::SingleAssetConcentration,
        IndicatorKind::Top3Concentration,
        IndicatorKind::CounterpartyConcentration,
        IndicatorKind::DailyRedemptionRate,
        IndicatorKind::PendingApprovalRatio,
        IndicatorKind::RedemptionVelocity7d,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::L1Ratio => "l1_ratio",
            Self::L1L2Ratio => "l1_l2_ratio",
            Self::RedemptionCoverage => "redemption_coverage",
            Self::LiquidityGap7d => "liquidity_gap_7d",
            Self::NavVolatility24h => "nav_volatility_24h",
            Self::AssetPriceDeviation => "asset_price_deviation",
            Self::OracleStaleness => "oracle_staleness",
            Self::SingleAssetConcentration => "single_asset",
            Self::Top3Concentration => "top3",
            Self::CounterpartyConcentration => "counterparty",
            Self::DailyRedemptionRate => "daily_redemption_rate",
            Self::PendingApprovalRatio => "pending_approval_ratio",
            Self::RedemptionVelocity7d => "redemption_velocity_7d",
        }
    }
}

impl fmt::Display for IndicatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which direction of movement is a breach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreachDirection {
    /// Higher values are worse (volatility, concentration, pressure).
    Above,
    /// Lower values are worse (liquidity ratios, coverage).
    Below,
}

/// Threshold triple for one indicator.
///
/// Values inside `normal` are NORMAL; past `normal` but short of `warning`
/// is ELEVATED; past `warning` is HIGH; past `critical` is CRITICAL.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IndicatorThresholds {
    pub direction: BreachDirection,
    pub normal: f64,
    pub warning: f64,
    pub critical: f64,
    /// Weight of this indicator in the 0-100 composite score.
    pub weight: f64,
}

impl IndicatorThresholds {
    /// Severity of a reading under these thresholds.
    #[must_use]
    pub fn severity(&self, value: f64) -> RiskLevel {
        let breached = |threshold: f64| match self.direction {
            BreachDirection::Above => value > threshold,
            BreachDirection::Below => value < threshold,
        };
        if breached(self.critical) {
            RiskLevel::Critical
        } else if breached(self.warning) {
            RiskLevel::High
        } else if breached(self.normal) {
            RiskLevel::Elevated
        } else {
            RiskLevel::Normal
        }
    }
}

/// One evaluated indicator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IndicatorReading {
    pub kind: IndicatorKind,
    pub value: f64,
    pub severity: RiskLevel,
}

/// Per-minute snapshot of all indicators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub timestamp: DateTime<Utc>,
    pub readings: Vec<IndicatorReading>,
    pub level: RiskLevel,
    /// Weighted severity score clamped to 0..=100.
    pub score: f64,
}

impl RiskSnapshot {
    /// Invariant: `level` equals the max per-indicator severity.
    #[must_use]
    pub fn level_consistent(&self) -> bool {
        let max = self
            .readings
            .iter()
            .map(|r| r.severity)
            .max()
            .unwrap_or(RiskLevel::Normal);
        self.level == max
    }
}

/// A persisted risk occurrence (alert, drift warning, incident transition).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskEvent {
    pub id: String,
    pub level: RiskLevel,
    pub source: String,
    pub message: String,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Notification severity for operator channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NotifySeverity {
    Info,
    Warning,
    Critical,
}

/// A typed notification. Transports (Slack/email/phone) live outside the core;
/// the engines only emit these values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub severity: NotifySeverity,
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    #[must_use]
    pub fn new(severity: NotifySeverity, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            severity,
            title: title.into(),
            body: body.into(),
            created_at: Utc::now(),
        }
    }
}

// ============================================================================
// Liquidity forecast
// ============================================================================

/// Forecast horizon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForecastHorizon {
    D1,
    D7,
    D30,
}

impl ForecastHorizon {
    #[must_use]
    pub fn days(&self) -> u32 {
        match self {
            Self::D1 => 1,
            Self::D7 => 7,
            Self::D30 => 30,
        }
    }
}

impl fmt::Display for ForecastHorizon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}d", self.days())
    }
}

/// Recommended response to a forecast shortfall probability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LiquidityRecommendation {
    None,
    Monitor,
    PrepareLiquidity,
    Emergency,
}

/// Forecast output for one horizon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidityForecast {
    pub horizon: ForecastHorizon,
    pub confirmed_outflow: Amount,
    pub probabilistic_outflow: Amount,
    pub expected_inflow: Amount,
    pub available_liquidity: Amount,
    /// Deterministic gap `outflow − (available + inflow)`, clamped at zero.
    pub liquidity_gap: Amount,
    /// Monte-Carlo probability of a shortfall, 0.0..=1.0.
    pub shortfall_probability: f64,
    pub recommendation: LiquidityRecommendation,
    /// Amount the recommendation suggests raising.
    pub suggested_amount: Amount,
    pub generated_at: DateTime<Utc>,
}

/// Generate a risk event id: `RSK-` + 8 uppercase hex chars.
#[must_use]
pub fn new_risk_event_id() -> String {
    format!(
        "RSK-{}",
        &uuid::Uuid::new_v4().simple().to_string()[..8].to_uppercase()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn below(normal: f64, warning: f64, critical: f64) -> IndicatorThresholds {
        IndicatorThresholds {
            direction: BreachDirection::Below,
            normal,
            warning,
            critical,
            weight: 1.0,
        }
    }

    #[test]
    fn test_severity_below_direction() {
        // l1_ratio style: breaches when it drops.
        let t = below(0.10, 0.08, 0.05);
        assert_eq!(t.severity(0.12), RiskLevel::Normal);
        assert_eq!(t.severity(0.10), RiskLevel::Normal);
        assert_eq!(t.severity(0.09), RiskLevel::Elevated);
        assert_eq!(t.severity(0.07), RiskLevel::High);
        assert_eq!(t.severity(0.04), RiskLevel::Critical);
    }

    #[test]
    fn test_severity_above_direction() {
        let t = IndicatorThresholds {
            direction: BreachDirection::Above,
            normal: 0.02,
            warning: 0.05,
            critical: 0.10,
            weight: 1.0,
        };
        assert_eq!(t.severity(0.01), RiskLevel::Normal);
        assert_eq!(t.severity(0.03), RiskLevel::Elevated);
        assert_eq!(t.severity(0.06), RiskLevel::High);
        assert_eq!(t.severity(0.11), RiskLevel::Critical);
    }

    #[test]
    fn test_risk_level_ordering() {
        assert!(RiskLevel::Normal < RiskLevel::Elevated);
        assert!(RiskLevel::High < RiskLevel::Critical);
    }

    #[test]
    fn test_snapshot_level_consistency() {
        let snapshot = RiskSnapshot {
            timestamp: Utc::now(),
            readings: vec![
                IndicatorReading {
                    kind: IndicatorKind::L1Ratio,
                    value: 0.09,
                    severity: RiskLevel::Elevated,
                },
                IndicatorReading {
                    kind: IndicatorKind::RedemptionCoverage,
                    value: 1.4,
                    severity: RiskLevel::Normal,
                },
            ],
            level: RiskLevel::Elevated,
            score: 12.0,
        };
        assert!(snapshot.level_consistent());
    }

    #[test]
    fn test_horizon_days() {
        assert_eq!(ForecastHorizon::D1.days(), 1);
        assert_eq!(ForecastHorizon::D7.days(), 7);
        assert_eq!(ForecastHorizon::D30.days(), 30);
    }
}
