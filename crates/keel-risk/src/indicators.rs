//! Indicator computation and thresholds.
//!
//! All indicators derive from the projection and pending-redemption tables.
//! Readings are dimensionless fractions except `oracle_staleness` (seconds).

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use keel_core::{
    Amount, BreachDirection, FundProjection, IndicatorKind, IndicatorReading,
    IndicatorThresholds, RiskLevel,
};
use keel_store::{Holding, RedemptionStats};

/// Per-indicator threshold table.
#[derive(Debug, Clone)]
pub struct IndicatorConfig {
    thresholds: HashMap<IndicatorKind, IndicatorThresholds>,
}

impl IndicatorConfig {
    #[must_use]
    pub fn thresholds_for(&self, kind: IndicatorKind) -> &IndicatorThresholds {
        &self.thresholds[&kind]
    }

    pub fn set(&mut self, kind: IndicatorKind, thresholds: IndicatorThresholds) {
        self.thresholds.insert(kind, thresholds);
    }
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        use BreachDirection::{Above, Below};
        use IndicatorKind as K;
        let t = |direction, normal, warning, critical, weight| IndicatorThresholds {
            direction,
            normal,
            warning,
            critical,
            weight,
        };
        let mut thresholds = HashMap::new();
        thresholds.insert(K::L1Ratio, t(Below, 0.08, 0.06, 0.05, 20.0));
        thresholds.insert(K::L1L2Ratio, t(Below, 0.35, 0.30, 0.25, 10.0));
        thresholds.insert(K::RedemptionCoverage, t(Below, 1.2, 1.0, 0.8, 15.0));
        thresholds.insert(K::LiquidityGap7d, t(Above, 0.0, 0.05, 0.10, 15.0));
        thresholds.insert(K::NavVolatility24h, t(Above, 0.02, 0.05, 0.10, 10.0));
        thresholds.insert(K::AssetPriceDeviation, t(Above, 0.01, 0.03, 0.05, 5.0));
        thresholds.insert(K::OracleStaleness, t(Above, 3_600.0, 14_400.0, 86_400.0, 5.0));
        thresholds.insert(K::SingleAssetConcentration, t(Above, 0.30, 0.40, 0.50, 5.0));
        thresholds.insert(K::Top3Concentration, t(Above, 0.60, 0.75, 0.90, 5.0));
        thresholds.insert(K::CounterpartyConcentration, t(Above, 0.30, 0.40, 0.50, 5.0));
        thresholds.insert(K::DailyRedemptionRate, t(Above, 0.05, 0.10, 0.20, 10.0));
        thresholds.insert(K::PendingApprovalRatio, t(Above, 0.30, 0.50, 0.70, 5.0));
        thresholds.insert(K::RedemptionVelocity7d, t(Above, 0.15, 0.25, 0.40, 10.0));
        Self { thresholds }
    }
}

/// Everything the evaluator reads, gathered by the monitor.
#[derive(Debug, Clone)]
pub struct IndicatorInputs {
    pub fund: FundProjection,
    pub holdings: Vec<Holding>,
    pub stats: RedemptionStats,
    /// NAV series for the trailing 24 h, ascending.
    pub nav_history: Vec<(DateTime<Utc>, Amount)>,
    pub pending_outflow_7d: Amount,
    pub now: DateTime<Utc>,
}

/// Compute all indicator readings.
#[must_use]
pub fn evaluate(config: &IndicatorConfig, inputs: &IndicatorInputs) -> Vec<IndicatorReading> {
    let total = inputs.fund.total_assets.to_f64_lossy();
    let frac = |amount: Amount| {
        if total > 0.0 {
            amount.to_f64_lossy() / total
        } else {
            0.0
        }
    };

    let l1 = inputs.fund.l1_total();
    let liquid = l1.saturating_add(inputs.fund.l2);
    let liability = inputs.fund.total_redemption_liability;

    let coverage = if liability.is_zero() {
        // Fully covered when nothing is owed.
        10.0
    } else {
        liquid.to_f64_lossy() / liability.to_f64_lossy()
    };

    let gap = inputs.pending_outflow_7d.saturating_sub(liquid);

    let (volatility, price_deviation, staleness) = nav_metrics(&inputs.nav_history, inputs.now);

    let mut shares: Vec<f64> = inputs.holdings.iter().map(|h| frac(h.value)).collect();
    shares.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let single = shares.first().copied().unwrap_or(0.0);
    let top3: f64 = shares.iter().take(3).sum();

    let pending_ratio = if inputs.stats.open_count == 0 {
        0.0
    } else {
        inputs.stats.pending_approval_count as f64 / inputs.stats.open_count as f64
    };

    let values = [
        (IndicatorKind::L1Ratio, frac(l1)),
        (IndicatorKind::L1L2Ratio, frac(liquid)),
        (IndicatorKind::RedemptionCoverage, coverage),
        (IndicatorKind::LiquidityGap7d, frac(gap)),
        (IndicatorKind::NavVolatility24h, volatility),
        (IndicatorKind::AssetPriceDeviation, price_deviation),
        (IndicatorKind::OracleStaleness, staleness),
        (IndicatorKind::SingleAssetConcentration, single),
        (IndicatorKind::Top3Concentration, top3),
        (IndicatorKind::CounterpartyConcentration, single),
        (
            IndicatorKind::DailyRedemptionRate,
            frac(inputs.stats.settled_24h),
        ),
        (IndicatorKind::PendingApprovalRatio, pending_ratio),
        (
            IndicatorKind::RedemptionVelocity7d,
            frac(inputs.stats.settled_7d),
        ),
    ];

    values
        .into_iter()
        .map(|(kind, value)| IndicatorReading {
            kind,
            value,
            severity: config.thresholds_for(kind).severity(value),
        })
        .collect()
}

/// Max severity across readings, mapped 1..4.
#[must_use]
pub fn overall_level(readings: &[IndicatorReading]) -> RiskLevel {
    readings
        .iter()
        .map(|r| r.severity)
        .max()
        .unwrap_or(RiskLevel::Normal)
}

/// Weighted severity score clamped to 0..=100.
#[must_use]
pub fn score(config: &IndicatorConfig, readings: &[IndicatorReading]) -> f64 {
    let mut weighted = 0.0;
    let mut total_weight = 0.0;
    for reading in readings {
        let weight = config.thresholds_for(reading.kind).weight;
        let factor = match reading.severity {
            RiskLevel::Normal => 0.0,
            RiskLevel::Elevated => 1.0 / 3.0,
            RiskLevel::High => 2.0 / 3.0,
            RiskLevel::Critical => 1.0,
        };
        weighted += weight * factor;
        total_weight += weight;
    }
    if total_weight == 0.0 {
        return 0.0;
    }
    (weighted / total_weight * 100.0).clamp(0.0, 100.0)
}

/// Volatility of returns, peak deviation, and staleness from the NAV series.
fn nav_metrics(history: &[(DateTime<Utc>, Amount)], now: DateTime<Utc>) -> (f64, f64, f64) {
    let staleness = history
        .last()
        .map(|(at, _)| (now - *at).num_seconds().max(0) as f64)
        .unwrap_or(f64::INFINITY);

    if history.len() < 2 {
        return (0.0, 0.0, staleness);
    }

    let prices: Vec<f64> = history.iter().map(|(_, p)| p.to_f64_lossy()).collect();
    let returns: Vec<f64> = prices
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| w[1] / w[0] - 1.0)
        .collect();
    let volatility = std_dev(&returns);

    let mean = prices.iter().sum::<f64>() / prices.len() as f64;
    let deviation = if mean > 0.0 {
        let max = prices.iter().cloned().fold(f64::MIN, f64::max);
        let min = prices.iter().cloned().fold(f64::MAX, f64::min);
        (max - min) / mean
    } else {
        0.0
    };

    (volatility, deviation, staleness)
}

fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::Tier;

    fn healthy_inputs() -> IndicatorInputs {
        let mut fund = FundProjection::genesis();
        fund.total_assets = Amount::from_units(1_000_000);
        fund.l1_cash = Amount::from_units(100_000);
        fund.l2 = Amount::from_units(300_000);
        fund.l3 = Amount::from_units(600_000);
        fund.total_redemption_liability = Amount::from_units(50_000);
        let now = Utc::now();
        IndicatorInputs {
            fund,
            holdings: vec![
                Holding {
                    asset: alloy::primitives::Address::with_last_byte(1),
                    tier: Tier::L3,
                    value: Amount::from_units(200_000),
                },
                Holding {
                    asset: alloy::primitives::Address::with_last_byte(2),
                    tier: Tier::L3,
                    value: Amount::from_units(200_000),
                },
                Holding {
                    asset: alloy::primitives::Address::with_last_byte(3),
                    tier: Tier::L2,
                    value: Amount::from_units(200_000),
                },
            ],
            stats: RedemptionStats::default(),
            nav_history: vec![(now, Amount::from_units(1))],
            pending_outflow_7d: Amount::from_units(20_000),
            now,
        }
    }

    #[test]
    fn test_healthy_book_is_normal() {
        let config = IndicatorConfig::default();
        let readings = evaluate(&config, &healthy_inputs());
        assert_eq!(readings.len(), IndicatorKind::ALL.len());
        assert_eq!(overall_level(&readings), RiskLevel::Normal);
        assert_eq!(score(&config, &readings), 0.0);
    }

    #[test]
    fn test_l1_depletion_escalates() {
        let config = IndicatorConfig::default();
        let mut inputs = healthy_inputs();
        inputs.fund.l1_cash = Amount::from_units(40_000); // 4% of book
        let readings = evaluate(&config, &inputs);
        let l1 = readings
            .iter()
            .find(|r| r.kind == IndicatorKind::L1Ratio)
            .unwrap();
        assert_eq!(l1.severity, RiskLevel::Critical);
        assert_eq!(overall_level(&readings), RiskLevel::Critical);
        assert!(score(&config, &readings) > 0.0);
    }

    #[test]
    fn test_level_is_max_severity() {
        let config = IndicatorConfig::default();
        let mut inputs = healthy_inputs();
        // Push one indicator to HIGH: daily redemption rate at 12%.
        inputs.stats.settled_24h = Amount::from_units(120_000);
        let readings = evaluate(&config, &inputs);
        assert_eq!(overall_level(&readings), RiskLevel::High);
        // Invariant: snapshot level equals max severity.
        let max = readings.iter().map(|r| r.severity).max().unwrap();
        assert_eq!(overall_level(&readings), max);
    }

    #[test]
    fn test_liquidity_gap_indicator() {
        let config = IndicatorConfig::default();
        let mut inputs = healthy_inputs();
        // Outflow 520k vs 400k liquid: gap 120k = 12% of the book.
        inputs.pending_outflow_7d = Amount::from_units(520_000);
        let readings = evaluate(&config, &inputs);
        let gap = readings
            .iter()
            .find(|r| r.kind == IndicatorKind::LiquidityGap7d)
            .unwrap();
        assert!((gap.value - 0.12).abs() < 1e-9);
        assert_eq!(gap.severity, RiskLevel::Critical);
    }

    #[test]
    fn test_score_clamps_to_hundred() {
        let config = IndicatorConfig::default();
        let readings: Vec<IndicatorReading> = IndicatorKind::ALL
            .iter()
            .map(|&kind| IndicatorReading {
                kind,
                value: 0.0,
                severity: RiskLevel::Critical,
            })
            .collect();
        assert_eq!(score(&config, &readings), 100.0);
    }
}
