//! # price_feed: current prices and market condition per symbol
//!
//! [`TickPriceFeed`] is fed by the EA's tick pushes and keeps, per symbol,
//! the latest quote plus a short buffer of mids from which volatility is
//! derived.
//!
//! When no live quote exists the engine falls back to a fixed table
//! ([`fallback_price`]) and logs a warning every time: decisions made on a
//! fallback price are less trustworthy.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::models::{MarketCondition, Quote, TickData};

/// Ticks kept per symbol for the volatility estimate.
const TICK_BUFFER_SIZE: usize = 30;

/// Used when the EA does not report liquidity.
const DEFAULT_LIQUIDITY: f64 = 1.0;

#[async_trait]
pub trait PriceFeed: Send + Sync {
    async fn current_price(&self, symbol: &str) -> Option<Quote>;

    async fn market_condition(&self, symbol: &str) -> Option<MarketCondition>;
}

// ─── Fallback ─────────────────────────────────────────────────────────────────

/// Last-resort reference prices.
pub fn fallback_price(symbol: &str) -> Option<f64> {
    match symbol {
        "USDJPY" => Some(150.0),
        "EURUSD" => Some(1.0800),
        "GBPUSD" => Some(1.2700),
        "XAUUSD" => Some(2000.0),
        _ => None,
    }
}

/// A quote and whether it came from the fallback table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedQuote {
    pub quote: Quote,
    pub is_fallback: bool,
}

/// Live quote if the feed has one, otherwise the fallback table.
pub async fn resolve_quote(feed: &dyn PriceFeed, symbol: &str) -> Option<ResolvedQuote> {
    if let Some(quote) = feed.current_price(symbol).await {
        return Some(ResolvedQuote { quote, is_fallback: false });
    }
    let price = fallback_price(symbol)?;
    warn!(symbol, price, "⚠️ [FEED] No live quote — using fallback price");
    Some(ResolvedQuote { quote: Quote::flat(price), is_fallback: true })
}

/// Live market condition, or a neutral one built on the fallback price.
/// The entry gate refuses the latter.
pub async fn resolve_market_condition(feed: &dyn PriceFeed, symbol: &str) -> Option<MarketCondition> {
    if let Some(condition) = feed.market_condition(symbol).await {
        return Some(condition);
    }
    let price = fallback_price(symbol)?;
    warn!(symbol, price, "⚠️ [FEED] No live market data — using fallback price");
    Some(MarketCondition {
        current_price: price,
        spread: 0.0,
        volatility: 0.0,
        liquidity: DEFAULT_LIQUIDITY,
        is_fallback: true,
    })
}

// ─── TickPriceFeed ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct SymbolBook {
    quote: Quote,
    liquidity: Option<f64>,
    mids: VecDeque<f64>,
}

#[derive(Default)]
pub struct TickPriceFeed {
    books: RwLock<HashMap<String, SymbolBook>>,
}

impl TickPriceFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a tick. Called for every EA push before trail evaluation.
    pub async fn record(&self, tick: &TickData) {
        let quote = tick.quote();
        let mut books = self.books.write().await;
        let book = books.entry(tick.symbol.clone()).or_insert_with(|| SymbolBook {
            quote,
            liquidity: None,
            mids: VecDeque::with_capacity(TICK_BUFFER_SIZE + 1),
        });

        if book.mids.len() >= TICK_BUFFER_SIZE {
            book.mids.pop_front();
        }
        book.mids.push_back(quote.mid());
        book.quote = quote;
        if tick.liquidity.is_some() {
            book.liquidity = tick.liquidity;
        }
        debug!(symbol = %tick.symbol, bid = tick.bid, ask = tick.ask, "[FEED] tick recorded");
    }

    pub async fn symbols(&self) -> Vec<String> {
        self.books.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl PriceFeed for TickPriceFeed {
    async fn current_price(&self, symbol: &str) -> Option<Quote> {
        self.books.read().await.get(symbol).map(|b| b.quote)
    }

    async fn market_condition(&self, symbol: &str) -> Option<MarketCondition> {
        let books = self.books.read().await;
        let book = books.get(symbol)?;
        let mid = book.quote.mid();

        let (lo, hi) = book
            .mids
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &m| (lo.min(m), hi.max(m)));
        let volatility = if book.mids.len() >= 2 && mid > 0.0 { (hi - lo) / mid } else { 0.0 };

        Some(MarketCondition {
            current_price: mid,
            spread: book.quote.spread(),
            volatility,
            liquidity: book.liquidity.unwrap_or(DEFAULT_LIQUIDITY),
            is_fallback: false,
        })
    }
}
