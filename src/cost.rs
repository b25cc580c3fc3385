//! Token and cost accounting shared by every completion call of a session

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Price of one model, USD per million tokens
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelRate {
    /// Input (prompt) price
    pub input: f64,
    /// Output (completion) price
    pub output: f64,
}

impl ModelRate {
    /// Create a new rate
    pub const fn new(input: f64, output: f64) -> Self {
        Self { input, output }
    }

    /// Cost in USD of one call
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 * self.input + output_tokens as f64 * self.output) / 1_000_000.0
    }
}

/// Per-model rates with a fallback for unknown identifiers
#[derive(Debug, Clone)]
pub struct PricingTable {
    rates: HashMap<String, ModelRate>,
    default_rate: ModelRate,
}

impl PricingTable {
    /// Create an empty table that prices everything at `default_rate`
    pub fn new(default_rate: ModelRate) -> Self {
        Self {
            rates: HashMap::new(),
            default_rate,
        }
    }

    /// Add or replace a model rate
    pub fn insert(&mut self, model: impl Into<String>, rate: ModelRate) {
        self.rates.insert(model.into(), rate);
    }

    /// Builder form of [`PricingTable::insert`]
    pub fn with_rate(mut self, model: impl Into<String>, rate: ModelRate) -> Self {
        self.insert(model, rate);
        self
    }

    /// Rate for a model id. Provider prefixes ("openai/gpt-4o") fall back to
    /// the bare name before the default applies.
    pub fn rate_for(&self, model: &str) -> ModelRate {
        if let Some(rate) = self.rates.get(model) {
            return *rate;
        }
        model
            .rsplit_once('/')
            .and_then(|(_, bare)| self.rates.get(bare))
            .copied()
            .unwrap_or(self.default_rate)
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::new(ModelRate::new(0.15, 0.60))
            .with_rate("gpt-4o-mini", ModelRate::new(0.15, 0.60))
            .with_rate("gpt-4o", ModelRate::new(5.00, 15.00))
    }
}

/// Running totals for a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostState {
    /// Sum of prompt tokens
    pub total_input_tokens: u64,
    /// Sum of completion tokens
    pub total_output_tokens: u64,
    /// Accumulated cost in USD
    pub cost_usd: f64,
    /// Number of recorded calls
    pub calls: u64,
}

impl CostState {
    /// Prompt plus completion tokens
    pub fn total_tokens(&self) -> u64 {
        self.total_input_tokens + self.total_output_tokens
    }

    /// Compact summary with cost rounded to six decimals
    pub fn summary(&self) -> CostSummary {
        CostSummary {
            total_tokens: self.total_tokens(),
            cost_usd: (self.cost_usd * 1_000_000.0).round() / 1_000_000.0,
        }
    }
}

/// Reporting view of [`CostState`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostSummary {
    /// Total tokens
    pub total_tokens: u64,
    /// Rounded cost in USD
    pub cost_usd: f64,
}

/// Process-wide accumulator, shared as `Arc<CostAccumulator>` by every stage
/// and fan-out branch.
#[derive(Debug)]
pub struct CostAccumulator {
    pricing: PricingTable,
    state: Mutex<CostState>,
}

impl CostAccumulator {
    /// Create an accumulator with the given pricing
    pub fn new(pricing: PricingTable) -> Self {
        Self {
            pricing,
            state: Mutex::new(CostState::default()),
        }
    }

    /// Book one completion call. The whole increment happens under one lock.
    pub fn record(&self, model: &str, input_tokens: u64, output_tokens: u64) {
        let increment = self.pricing.rate_for(model).cost(input_tokens, output_tokens);
        let mut state = self.state.lock();
        state.total_input_tokens += input_tokens;
        state.total_output_tokens += output_tokens;
        state.cost_usd += increment;
        state.calls += 1;
        tracing::debug!(
            model,
            input_tokens,
            output_tokens,
            increment,
            total_usd = state.cost_usd,
            "cost recorded"
        );
    }

    /// Copy of the current totals
    pub fn snapshot(&self) -> CostState {
        *self.state.lock()
    }

    /// Pricing in use
    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }
}

impl Default for CostAccumulator {
    fn default() -> Self {
        Self::new(PricingTable::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_known_and_default_rates() {
        let table = PricingTable::default();
        assert_eq!(table.rate_for("gpt-4o"), ModelRate::new(5.0, 15.0));
        assert_eq!(table.rate_for("openai/gpt-4o"), ModelRate::new(5.0, 15.0));
        assert_eq!(table.rate_for("someone/unknown-model"), ModelRate::new(0.15, 0.60));
    }

    #[test]
    fn test_record_computes_cost() {
        let acc = CostAccumulator::default();
        acc.record("gpt-4o", 1_000_000, 1_000_000);
        let state = acc.snapshot();
        assert_eq!(state.total_tokens(), 2_000_000);
        assert!((state.cost_usd - 20.0).abs() < 1e-9);
        assert_eq!(state.calls, 1);
    }

    #[test]
    fn test_summary_rounds() {
        let state = CostState {
            total_input_tokens: 3,
            total_output_tokens: 4,
            cost_usd: 0.123_456_789,
            calls: 2,
        };
        let summary = state.summary();
        assert_eq!(summary.total_tokens, 7);
        assert!((summary.cost_usd - 0.123_457).abs() < 1e-12);
    }

    #[test]
    fn test_concurrent_records_lose_nothing() {
        let acc = Arc::new(CostAccumulator::default());
        let handles: Vec<_> = (1..=16u64)
            .map(|i| {
                let acc = Arc::clone(&acc);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        acc.record("gpt-4o-mini", i, i * 2);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let expected: u64 = (1..=16u64).map(|i| (i + i * 2) * 100).sum();
        let state = acc.snapshot();
        assert_eq!(state.total_tokens(), expected);
        assert_eq!(state.calls, 1600);
    }
}
