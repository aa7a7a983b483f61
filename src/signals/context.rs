// =============================================================================
// Context Validator: Market-context adjustments for raw component scores
// =============================================================================
//
// Every validator maps `(score, fact) -> score'` with score' in [0, 100].
// The adjustment layer is advisory: a fact that cannot be used (non-finite,
// absent) leaves the score as it was instead of failing the analysis.
//
// Bounded validators share one transform:
//
//   score' = 50 + (score - 50) * factor,   factor in [0.5, 1.3]
//
// so the direction of a score (above / below 50) can never flip.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::TrendLabel;

/// Oscillator level at or below which the market counts as oversold.
const OVERSOLD_LEVEL: f64 = 30.0;
/// Oscillator level at or above which the market counts as overbought.
const OVERBOUGHT_LEVEL: f64 = 70.0;
/// Bullish score guaranteed on oversold, and the cap in a strong downtrend.
const OVERSOLD_SCORE: f64 = 60.0;
/// Bearish score guaranteed on overbought, and the floor in a strong uptrend.
const OVERBOUGHT_SCORE: f64 = 40.0;

const HIGH_VOLUME_RATIO: f64 = 2.0;
const VOLUME_AMPLIFY: f64 = 1.3;
const VOLUME_SUPPRESS: f64 = 0.8;

/// Absolute funding rate (decimal) above which the score is pulled to neutral.
const EXTREME_FUNDING_RATE: f64 = 0.01;

const MIN_FACTOR: f64 = 0.5;
const MAX_FACTOR: f64 = 1.3;

/// Range age (in bars) at which a range counts as fully mature.
const MATURE_RANGE_BARS: f64 = 20.0;

/// Optional market-context facts for one symbol at one point in time.
///
/// Each field feeds exactly one validator; absent fields skip it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketContext {
    /// Oscillator reading (RSI-style, 0..100) paired with `trend`.
    #[serde(default)]
    pub oscillator: Option<f64>,
    #[serde(default)]
    pub trend: Option<TrendLabel>,
    /// Current volume / average volume.
    #[serde(default)]
    pub volume_ratio: Option<f64>,
    /// Price change over the same period as `volume_ratio`, in percent.
    #[serde(default)]
    pub price_change_pct: Option<f64>,
    /// Funding rate as a decimal (0.0001 = 0.01%).
    #[serde(default)]
    pub funding_rate: Option<f64>,
    /// How many bars the current trading range has held.
    #[serde(default)]
    pub range_age_bars: Option<f64>,
    /// Divergence strength paired with `volatility`.
    #[serde(default)]
    pub divergence_strength: Option<f64>,
    #[serde(default)]
    pub volatility: Option<f64>,
    /// Agreement of timeframes with the score direction, in [-1, 1].
    #[serde(default)]
    pub trend_alignment: Option<f64>,
    /// Current depth / average depth, paired with `spread_ratio`.
    #[serde(default)]
    pub liquidity_ratio: Option<f64>,
    /// Current spread / typical spread.
    #[serde(default)]
    pub spread_ratio: Option<f64>,
}

/// Stateless collection of context validators.
pub struct ContextValidator;

impl ContextValidator {
    /// Run every validator whose context fact is present, in a fixed order.
    pub fn apply(score: f64, ctx: &MarketContext) -> f64 {
        let mut adjusted = sanitize(score);

        if let (Some(osc), Some(trend)) = (ctx.oscillator, ctx.trend) {
            adjusted = validate_oversold_overbought(adjusted, osc, trend);
        }
        if let (Some(ratio), Some(change)) = (ctx.volume_ratio, ctx.price_change_pct) {
            adjusted = validate_volume_context(adjusted, ratio, change);
        }
        if let Some(age) = ctx.range_age_bars {
            adjusted = validate_range_position(adjusted, age);
        }
        if let (Some(strength), Some(vol)) = (ctx.divergence_strength, ctx.volatility) {
            adjusted = validate_divergence(adjusted, strength, vol);
        }
        if let Some(alignment) = ctx.trend_alignment {
            adjusted = validate_trend_alignment(adjusted, alignment);
        }
        if let Some(liquidity) = ctx.liquidity_ratio {
            let spread = ctx.spread_ratio.unwrap_or(1.0);
            adjusted = validate_liquidity(adjusted, liquidity, spread);
        }
        // Funding last: it bounds the final value into the neutral band.
        if let Some(rate) = ctx.funding_rate {
            adjusted = validate_funding_extremes(adjusted, rate);
        }

        debug!(
            raw = format!("{:.2}", score),
            adjusted = format!("{:.2}", adjusted),
            "context validation applied"
        );
        adjusted
    }
}

/// Dampen oscillator extremes that fight a strong trend, otherwise guarantee
/// a minimum directional strength.
pub fn validate_oversold_overbought(score: f64, oscillator: f64, trend: TrendLabel) -> f64 {
    let score = sanitize(score);
    if !oscillator.is_finite() {
        return score;
    }

    let adjusted = if oscillator <= OVERSOLD_LEVEL {
        if trend == TrendLabel::StrongDowntrend {
            score.min(OVERSOLD_SCORE)
        } else {
            score.max(OVERSOLD_SCORE)
        }
    } else if oscillator >= OVERBOUGHT_LEVEL {
        if trend == TrendLabel::StrongUptrend {
            score.max(OVERBOUGHT_SCORE)
        } else {
            score.min(OVERBOUGHT_SCORE)
        }
    } else {
        score
    };

    clip(adjusted)
}

/// Amplify a score when high volume confirms the price move, suppress it
/// otherwise.
pub fn validate_volume_context(score: f64, volume_ratio: f64, price_change_pct: f64) -> f64 {
    let score = sanitize(score);
    if !volume_ratio.is_finite() || !price_change_pct.is_finite() {
        return score;
    }

    let confirms = (score > 50.0 && price_change_pct > 0.0)
        || (score < 50.0 && price_change_pct < 0.0);

    let factor = if volume_ratio > HIGH_VOLUME_RATIO && confirms {
        VOLUME_AMPLIFY
    } else {
        VOLUME_SUPPRESS
    };

    clip(50.0 + (score - 50.0) * factor)
}

/// Pull a score into the neutral band when funding is extreme in either
/// direction.
pub fn validate_funding_extremes(score: f64, funding_rate: f64) -> f64 {
    let score = sanitize(score);
    if !funding_rate.is_finite() || funding_rate.abs() <= EXTREME_FUNDING_RATE {
        return score;
    }

    (50.0 + (score - 50.0) * 0.5).clamp(40.0, 60.0)
}

/// Young ranges damp breakouts, mature ranges confirm them.
pub fn validate_range_position(score: f64, range_age_bars: f64) -> f64 {
    if !range_age_bars.is_finite() {
        return sanitize(score);
    }
    let maturity = (range_age_bars.max(0.0) / MATURE_RANGE_BARS).min(1.0);
    bounded_linear(score, 0.7 + 0.5 * maturity)
}

/// Weigh a divergence by its strength relative to prevailing volatility.
pub fn validate_divergence(score: f64, divergence_strength: f64, volatility: f64) -> f64 {
    if !divergence_strength.is_finite() || !volatility.is_finite() {
        return sanitize(score);
    }
    let ratio = if volatility > f64::EPSILON {
        (divergence_strength.abs() / volatility).min(1.0)
    } else {
        1.0
    };
    bounded_linear(score, 0.5 + 0.8 * ratio)
}

/// `alignment` of +1 means every timeframe agrees with the score direction.
pub fn validate_trend_alignment(score: f64, alignment: f64) -> f64 {
    if !alignment.is_finite() {
        return sanitize(score);
    }
    bounded_linear(score, 0.9 + 0.4 * alignment.clamp(-1.0, 1.0))
}

/// Thin books and wide spreads make a score less trustworthy.
pub fn validate_liquidity(score: f64, liquidity_ratio: f64, spread_ratio: f64) -> f64 {
    if !liquidity_ratio.is_finite() || !spread_ratio.is_finite() {
        return sanitize(score);
    }
    let depth = liquidity_ratio.clamp(0.0, 2.0);
    bounded_linear(score, (0.5 + 0.4 * depth) / spread_ratio.max(1.0))
}

/// `50 + (score - 50) * factor` with `factor` forced into [0.5, 1.3].
pub fn bounded_linear(score: f64, factor: f64) -> f64 {
    let score = sanitize(score);
    if !factor.is_finite() {
        return score;
    }
    let factor = factor.clamp(MIN_FACTOR, MAX_FACTOR);
    clip(50.0 + (score - 50.0) * factor)
}

fn clip(score: f64) -> f64 {
    score.clamp(0.0, 100.0)
}

fn sanitize(score: f64) -> f64 {
    if score.is_finite() {
        clip(score)
    } else {
        50.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversold_in_strong_downtrend_is_capped() {
        let s = validate_oversold_overbought(85.0, 22.0, TrendLabel::StrongDowntrend);
        assert!((s - OVERSOLD_SCORE).abs() < f64::EPSILON);
    }

    #[test]
    fn oversold_elsewhere_guarantees_minimum() {
        let s = validate_oversold_overbought(45.0, 22.0, TrendLabel::Sideways);
        assert!((s - OVERSOLD_SCORE).abs() < f64::EPSILON);
        let s = validate_oversold_overbought(80.0, 22.0, TrendLabel::Uptrend);
        assert!((s - 80.0).abs() < f64::EPSILON);
    }

    #[test]
    fn overbought_mirrors_oversold() {
        let s = validate_oversold_overbought(10.0, 80.0, TrendLabel::StrongUptrend);
        assert!((s - OVERBOUGHT_SCORE).abs() < f64::EPSILON);
        let s = validate_oversold_overbought(70.0, 80.0, TrendLabel::Downtrend);
        assert!((s - OVERBOUGHT_SCORE).abs() < f64::EPSILON);
        let s = validate_oversold_overbought(55.0, 50.0, TrendLabel::Downtrend);
        assert!((s - 55.0).abs() < f64::EPSILON);
    }

    #[test]
    fn high_volume_confirming_move_amplifies() {
        let s = validate_volume_context(70.0, 2.5, 1.2);
        assert!((s - 76.0).abs() < 1e-9);
        let s = validate_volume_context(30.0, 3.0, -0.8);
        assert!((s - 24.0).abs() < 1e-9);
    }

    #[test]
    fn volume_against_move_suppresses() {
        let s = validate_volume_context(70.0, 2.5, -1.0);
        assert!((s - 66.0).abs() < 1e-9);
        let s = validate_volume_context(70.0, 1.1, 1.0);
        assert!((s - 66.0).abs() < 1e-9);
    }

    #[test]
    fn extreme_funding_pulls_to_neutral_band() {
        let s = validate_funding_extremes(95.0, 0.015);
        assert!((40.0..=60.0).contains(&s));
        let s = validate_funding_extremes(5.0, -0.02);
        assert!((40.0..=60.0).contains(&s));
        let s = validate_funding_extremes(95.0, 0.0004);
        assert!((s - 95.0).abs() < f64::EPSILON);
    }

    #[test]
    fn bounded_validators_never_flip_direction() {
        let scores = [0.0, 10.0, 35.0, 49.0, 50.0, 51.0, 65.0, 90.0, 100.0];
        for &s in &scores {
            for factor_input in [-5.0, 0.0, 0.3, 1.0, 1.3, 9.0] {
                let out = [
                    bounded_linear(s, factor_input),
                    validate_range_position(s, factor_input * 10.0),
                    validate_divergence(s, factor_input, 0.5),
                    validate_trend_alignment(s, factor_input),
                    validate_liquidity(s, factor_input, 1.0 + factor_input.abs()),
                ];
                for o in out {
                    assert!((0.0..=100.0).contains(&o));
                    assert!((o - 50.0) * (s - 50.0) >= 0.0, "s={s} o={o}");
                }
            }
        }
    }

    #[test]
    fn factor_is_clamped() {
        assert!((bounded_linear(100.0, 10.0) - 100.0).abs() < 1e-9);
        assert!((bounded_linear(90.0, 10.0) - 100.0).abs() < 1e-9);
        assert!((bounded_linear(90.0, 0.0) - 70.0).abs() < 1e-9);
    }

    #[test]
    fn non_finite_inputs_fail_open() {
        assert!((validate_volume_context(72.0, f64::NAN, 1.0) - 72.0).abs() < f64::EPSILON);
        assert!((validate_funding_extremes(72.0, f64::INFINITY) - 72.0).abs() < f64::EPSILON);
        assert!((validate_trend_alignment(f64::NAN, 0.5) - 50.0).abs() < f64::EPSILON);
        assert!((validate_divergence(130.0, f64::NAN, 1.0) - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn apply_runs_present_validators_only() {
        let ctx = MarketContext::default();
        assert!((ContextValidator::apply(72.0, &ctx) - 72.0).abs() < f64::EPSILON);

        let ctx = MarketContext {
            trend_alignment: Some(1.0),
            funding_rate: Some(0.03),
            ..Default::default()
        };
        let s = ContextValidator::apply(80.0, &ctx);
        assert!((40.0..=60.0).contains(&s));
    }
}
