use riskgate_core::config::ScorerConfig;
use riskgate_core::{BookTicker, MarketSnapshot, Position, Side};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use tracing::{debug, info};

/// Inputs for one instrument in a scoring pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub symbol: String,
    pub adx: f64,
    /// Fast/slow EMA gap in percent.
    pub ema_diff_pct: f64,
    /// ATR in percent of price.
    pub atr_pct: f64,
    pub volume_rank: u32,
    pub ticker: Option<BookTicker>,
    pub funding_rate: Option<Decimal>,
}

impl Candidate {
    #[must_use]
    pub fn from_snapshot(
        snapshot: &MarketSnapshot,
        ticker: Option<BookTicker>,
        funding_rate: Option<Decimal>,
    ) -> Self {
        Self {
            symbol: snapshot.symbol.clone(),
            adx: snapshot.adx,
            ema_diff_pct: snapshot.ema_diff_pct(),
            atr_pct: snapshot.atr_pct,
            volume_rank: snapshot.volume_rank,
            ticker,
            funding_rate,
        }
    }
}

/// Binary gate applied before any scoring.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FilterRejection {
    AtrPctTooHigh { atr_pct: f64, max: f64 },
    SpreadTooWide { spread_pct: f64, max: f64 },
    FundingExtreme { rate: f64, max: f64 },
    VolumeTooLow { quote_volume: f64, min: f64 },
}

impl FilterRejection {
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::AtrPctTooHigh { .. } => "atr_pct_too_high",
            Self::SpreadTooWide { .. } => "spread_too_wide",
            Self::FundingExtreme { .. } => "funding_extreme",
            Self::VolumeTooLow { .. } => "volume_too_low",
        }
    }
}

impl fmt::Display for FilterRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreComponents {
    pub trend: f64,
    pub direction: f64,
    pub volatility: f64,
    pub liquidity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateScore {
    pub symbol: String,
    pub raw_score: f64,
    pub components: ScoreComponents,
    /// Product of all penalty multipliers, 1.0 when none apply.
    pub penalty: f64,
    pub penalty_reasons: Vec<String>,
    pub final_score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Selection {
    /// Best first, at most `top_n`.
    pub selected: Vec<CandidateScore>,
    pub rejected: Vec<(String, FilterRejection)>,
}

pub struct CandidateScorer {
    config: ScorerConfig,
}

impl CandidateScorer {
    #[must_use]
    pub const fn new(config: ScorerConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &ScorerConfig {
        &self.config
    }

    /// # Errors
    /// Returns the first failing gate.
    pub fn hard_filter(&self, candidate: &Candidate) -> Result<(), FilterRejection> {
        let cfg = &self.config;
        if candidate.atr_pct > cfg.max_atr_pct {
            return Err(FilterRejection::AtrPctTooHigh {
                atr_pct: candidate.atr_pct,
                max: cfg.max_atr_pct,
            });
        }

        if let Some(ticker) = &candidate.ticker {
            if let Some(spread_pct) = ticker.spread_pct().and_then(|s| s.to_f64()) {
                if spread_pct > cfg.max_spread_pct {
                    return Err(FilterRejection::SpreadTooWide {
                        spread_pct,
                        max: cfg.max_spread_pct,
                    });
                }
            }
        }

        if let Some(rate) = candidate.funding_rate.and_then(|r| r.to_f64()) {
            if rate.abs() > cfg.max_abs_funding {
                return Err(FilterRejection::FundingExtreme {
                    rate,
                    max: cfg.max_abs_funding,
                });
            }
        }

        if let Some(ticker) = &candidate.ticker {
            let quote_volume = ticker.quote_volume_24h.to_f64().unwrap_or(0.0);
            if quote_volume < cfg.min_quote_volume {
                return Err(FilterRejection::VolumeTooLow {
                    quote_volume,
                    min: cfg.min_quote_volume,
                });
            }
        }

        Ok(())
    }

    /// Volatility suitability: full marks inside the sweet band, linear
    /// falloff on both sides.
    #[must_use]
    pub fn volatility_component(&self, atr_pct: f64) -> f64 {
        let cfg = &self.config;
        if atr_pct < cfg.vol_sweet_low {
            (atr_pct / cfg.vol_sweet_low * 100.0).max(0.0)
        } else if atr_pct > cfg.vol_sweet_high {
            (100.0 - (atr_pct - cfg.vol_sweet_high) * cfg.vol_falloff).max(0.0)
        } else {
            100.0
        }
    }

    #[must_use]
    pub fn components(&self, candidate: &Candidate) -> ScoreComponents {
        let cfg = &self.config;
        ScoreComponents {
            trend: candidate.adx.clamp(0.0, cfg.adx_cap) / cfg.adx_cap * 100.0,
            direction: (candidate.ema_diff_pct.abs() * 10.0).min(100.0),
            volatility: self.volatility_component(candidate.atr_pct),
            liquidity: (100.0 - f64::from(candidate.volume_rank) * cfg.liquidity_rank_step).max(0.0),
        }
    }

    /// Weighted score before penalties.
    #[must_use]
    pub fn score(&self, candidate: &Candidate) -> CandidateScore {
        let c = self.components(candidate);
        let w = &self.config.weights;
        let raw_score = c.trend * w.trend + c.direction * w.direction + c.volatility * w.volatility + c.liquidity * w.liquidity;
        CandidateScore {
            symbol: candidate.symbol.clone(),
            raw_score,
            components: c,
            penalty: 1.0,
            penalty_reasons: Vec::new(),
            final_score: raw_score,
        }
    }

    /// Multiplies scores down for same-direction crowding and benchmark
    /// cluster overlap with `positions`.
    pub fn apply_overlap_penalty(&self, scores: &mut [CandidateScore], positions: &[Position], direction: Side) {
        let cfg = &self.config;
        let same_direction = positions.iter().filter(|p| p.side == direction).count();
        let cluster_held = positions
            .iter()
            .any(|p| p.side == direction && cfg.in_benchmark_cluster(&p.symbol));

        for s in scores.iter_mut() {
            let mut penalty = 1.0;
            let mut reasons = Vec::new();
            if same_direction >= cfg.same_direction_limit {
                penalty *= cfg.same_direction_penalty;
                reasons.push(format!("{direction}_overload({same_direction})"));
            }
            if cluster_held && cfg.in_benchmark_cluster(&s.symbol) {
                penalty *= cfg.cluster_penalty;
                reasons.push(format!("benchmark_cluster_{direction}"));
            }
            s.penalty = penalty;
            s.penalty_reasons = reasons;
            s.final_score = s.raw_score * penalty;
        }
    }

    /// Full pass: hard filter, score, penalize, rank, truncate to `top_n`.
    #[must_use]
    pub fn score_and_select(&self, candidates: &[Candidate], positions: &[Position], direction: Side) -> Selection {
        let mut rejected = Vec::new();
        let mut scored = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            match self.hard_filter(candidate) {
                Ok(()) => scored.push(self.score(candidate)),
                Err(rejection) => {
                    debug!(symbol = %candidate.symbol, reason = %rejection, "candidate filtered out");
                    rejected.push((candidate.symbol.clone(), rejection));
                }
            }
        }

        self.apply_overlap_penalty(&mut scored, positions, direction);

        scored.sort_by(|a, b| {
            b.final_score
                .partial_cmp(&a.final_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.symbol.cmp(&b.symbol))
        });
        scored.truncate(self.config.top_n);

        if !scored.is_empty() {
            let top: Vec<String> = scored
                .iter()
                .map(|s| format!("{}({:.0})", s.symbol, s.final_score))
                .collect();
            info!(
                direction = %direction,
                evaluated = candidates.len(),
                rejected = rejected.len(),
                top = %top.join(", "),
                "candidates ranked"
            );
        }

        Selection {
            selected: scored,
            rejected,
        }
    }
}
