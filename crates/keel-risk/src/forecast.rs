//! Liquidity forecasting with Monte-Carlo shortfall probability.

use chrono::{Duration as ChronoDuration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tracing::info;

use keel_core::{Amount, ForecastHorizon, LiquidityForecast, LiquidityRecommendation};
use keel_store::{ProjectionStore, RedemptionStore, Store};

use crate::error::RiskResult;

/// Forecast configuration.
#[derive(Debug, Clone)]
pub struct ForecastConfig {
    /// Monte-Carlo trial count.
    pub trials: u32,
    /// Trailing window for historical flow rates, days.
    pub history_window_days: u32,
    /// Fixed RNG seed; tests pin this, production leaves it unset and seeds
    /// from OS entropy.
    pub seed: Option<u64>,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            trials: 1_000,
            history_window_days: 90,
            seed: None,
        }
    }
}

/// Liquidity forecaster.
pub struct Forecaster {
    store: Arc<dyn Store>,
    config: ForecastConfig,
}

impl Forecaster {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: ForecastConfig) -> Self {
        Self { store, config }
    }

    /// Forecast one horizon.
    pub async fn forecast(&self, horizon: ForecastHorizon) -> RiskResult<LiquidityForecast> {
        let fund = self.store.fund().await?;
        let days = f64::from(horizon.days());
        let available = fund.l1_total().saturating_add(fund.l2);

        let confirmed = self
            .store
            .pending_outflow_within(Utc::now() + ChronoDuration::days(i64::from(horizon.days())))
            .await?;
        let rates = self
            .store
            .flow_rates(self.config.history_window_days)
            .await?;

        let total = fund.total_assets.to_f64_lossy();
        let probabilistic = total * rates.redemption_rate * days / 365.0;
        // Conservative: only half the historical inflow is counted on.
        let inflow = 0.5 * total * rates.deposit_rate * days / 365.0;

        let outflow_f = confirmed.to_f64_lossy() + probabilistic;
        let available_f = available.to_f64_lossy();
        let gap_f = (outflow_f - (available_f + inflow)).max(0.0);

        let probability = self.shortfall_probability(available_f, outflow_f, inflow);
        let (recommendation, suggested_f) = recommend(probability, gap_f);

        let forecast = LiquidityForecast {
            horizon,
            confirmed_outflow: confirmed,
            probabilistic_outflow: amount_from_f64(probabilistic),
            expected_inflow: amount_from_f64(inflow),
            available_liquidity: available,
            liquidity_gap: amount_from_f64(gap_f),
            shortfall_probability: probability,
            recommendation,
            suggested_amount: amount_from_f64(suggested_f),
            generated_at: Utc::now(),
        };
        info!(
            horizon = %horizon,
            probability = format!("{probability:.3}"),
            recommendation = ?recommendation,
            "Liquidity forecast"
        );
        Ok(forecast)
    }

    /// Monte-Carlo: per trial, outflow scales U(0.8, 1.2) and inflow
    /// U(0.5, 1.5); a trial is a shortfall when
    /// `available + inflow' < outflow'`.
    fn shortfall_probability(&self, available: f64, outflow: f64, inflow: f64) -> f64 {
        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut shortfalls = 0u32;
        for _ in 0..self.config.trials {
            let outflow_trial = outflow * rng.gen_range(0.8..1.2);
            let inflow_trial = inflow * rng.gen_range(0.5..1.5);
            if available + inflow_trial < outflow_trial {
                shortfalls += 1;
            }
        }
        f64::from(shortfalls) / f64::from(self.config.trials)
    }
}

fn recommend(probability: f64, gap: f64) -> (LiquidityRecommendation, f64) {
    if probability < 0.05 {
        (LiquidityRecommendation::None, 0.0)
    } else if probability < 0.20 {
        (LiquidityRecommendation::Monitor, 0.0)
    } else if probability < 0.50 {
        (LiquidityRecommendation::PrepareLiquidity, gap)
    } else {
        (LiquidityRecommendation::Emergency, gap * 1.2)
    }
}

/// Lossy conversion from base-unit f64 back to `Amount`, clamped at zero.
fn amount_from_f64(base_units: f64) -> Amount {
    if base_units <= 0.0 {
        return Amount::ZERO;
    }
    Amount::from_base(base_units.min(u128::MAX as f64) as u128)
}
