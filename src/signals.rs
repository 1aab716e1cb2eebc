//! Collaborator interfaces for signal generation
//!
//! The execution core consumes decisions through these traits and holds no
//! model state of its own. Regime classification, direction prediction and
//! any dip-waiting logic live entirely behind `SignalProvider`; cointegration
//! discovery lives behind `CointegrationProvider`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::Symbol;

/// ML ensemble output for one symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSignal {
    Buy,
    Sell,
    Hold,
}

#[derive(Debug, Clone)]
pub struct Decision {
    pub signal: TradeSignal,
    /// Model confidence in [0, 1]
    pub confidence: f64,
}

pub trait SignalProvider: Send {
    /// One decision per symbol per cycle; None when the model cannot decide
    /// (insufficient data, model not loaded, ...)
    fn signal(&mut self, symbol: &Symbol) -> Option<Decision>;
}

/// Spread signal for one cointegrated pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpreadAction {
    LongSpread,
    ShortSpread,
    Close,
    Hold,
}

#[derive(Debug, Clone)]
pub struct SpreadSignal {
    pub z_score: f64,
    pub signal: SpreadAction,
    pub hedge_ratio: f64,
}

pub trait CointegrationProvider: Send {
    /// Refresh the set of valid cointegrated pairs from the latest prices
    fn update_cointegration(&mut self, prices: &HashMap<Symbol, f64>);

    /// Signals keyed by pair id (`symbol1_symbol2`)
    fn generate_signals(&mut self, prices: &HashMap<Symbol, f64>)
        -> HashMap<String, SpreadSignal>;

    /// Pairs currently considered tradable, in priority order
    fn tradable_pairs(&self) -> Vec<(Symbol, Symbol)>;
}

/// Provider used when no model backend is wired in: always HOLD
#[derive(Debug, Default)]
pub struct NullSignalProvider;

impl SignalProvider for NullSignalProvider {
    fn signal(&mut self, _symbol: &Symbol) -> Option<Decision> {
        Some(Decision {
            signal: TradeSignal::Hold,
            confidence: 0.0,
        })
    }
}

/// Cointegration provider that never proposes a pair
#[derive(Debug, Default)]
pub struct NullCointegrationProvider;

impl CointegrationProvider for NullCointegrationProvider {
    fn update_cointegration(&mut self, _prices: &HashMap<Symbol, f64>) {}

    fn generate_signals(
        &mut self,
        _prices: &HashMap<Symbol, f64>,
    ) -> HashMap<String, SpreadSignal> {
        HashMap::new()
    }

    fn tradable_pairs(&self) -> Vec<(Symbol, Symbol)> {
        Vec::new()
    }
}
