//! # models::tick
//!
//! Defines [`TickData`], the quote the EA pushes on every price change, plus
//! the derived [`Quote`] and [`MarketCondition`] the engines consume.
//!
//! `Quote` is `Copy` on purpose: the trail check runs on every tick and must
//! not allocate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::Side;

/// A single price tick received from the EA bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickData {
    /// The trading symbol, e.g. `"EURUSD"`, `"USDJPY"`, `"XAUUSD"`.
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    /// Liquidity score in `[0, 1]` if the EA computes one.
    #[serde(default)]
    pub liquidity: Option<f64>,
    /// UTC timestamp when the terminal recorded this tick.
    #[serde(default = "Utc::now")]
    pub time: DateTime<Utc>,
    /// Account of the EA that pushed the tick; refreshes its link when set.
    #[serde(default, rename = "accountId")]
    pub account_id: Option<String>,
}

impl TickData {
    #[inline]
    pub fn quote(&self) -> Quote {
        Quote { bid: self.bid, ask: self.ask }
    }
}

// ─── Quote ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub bid: f64,
    pub ask: f64,
}

impl Quote {
    /// A single-number price (feeds that only report a last price).
    #[inline]
    pub fn flat(price: f64) -> Self {
        Self { bid: price, ask: price }
    }

    #[inline]
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    #[inline]
    pub fn spread(&self) -> f64 {
        self.ask - self.bid
    }

    /// The price a position on `side` would be closed at:
    /// longs sell into the bid, shorts buy from the ask.
    #[inline]
    pub fn exit_price(&self, side: Side) -> f64 {
        match side {
            Side::Buy => self.bid,
            Side::Sell => self.ask,
        }
    }
}

// ─── MarketCondition ──────────────────────────────────────────────────────────

/// Snapshot the entry gate is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MarketCondition {
    pub current_price: f64,
    pub spread: f64,
    /// Relative range of recent mids, `(max - min) / mid`.
    pub volatility: f64,
    /// `[0, 1]`, higher is deeper.
    pub liquidity: f64,
    /// True when the price came from the fallback table, not a live quote.
    pub is_fallback: bool,
}
