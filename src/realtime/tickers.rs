use crate::realtime::types::{TickerQuote, TickerRecord};
use std::collections::HashMap;

pub type TickerSnapshot = HashMap<String, TickerQuote>;

/// Current-value view over the ticker stream. Last write wins per symbol and
/// symbols are never dropped once seen.
#[derive(Debug, Default, Clone)]
pub struct TickerAggregator {
    quotes: TickerSnapshot,
    batches_applied: u64,
}

impl TickerAggregator {
    pub fn apply_batch<I>(&mut self, records: I) -> usize
    where
        I: IntoIterator<Item = TickerRecord>,
    {
        let mut applied = 0_usize;
        for record in records {
            self.quotes.insert(
                record.symbol,
                TickerQuote {
                    price: record.price,
                    volume_24h: record.volume_24h,
                    change_24h: record.change_24h,
                    timestamp: record.timestamp,
                },
            );
            applied += 1;
        }
        self.batches_applied = self.batches_applied.saturating_add(1);
        applied
    }

    pub fn snapshot(&self) -> TickerSnapshot {
        self.quotes.clone()
    }

    pub fn quote(&self, symbol: &str) -> Option<&TickerQuote> {
        self.quotes.get(symbol)
    }

    pub fn len(&self) -> usize {
        self.quotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }

    pub fn batches_applied(&self) -> u64 {
        self.batches_applied
    }
}
