use std::cmp::Ordering;
use std::collections::HashSet;
use std::time::Duration;

use tokio::time::Instant;

use crate::rpc::Transaction;

pub const CACHE_TTL: Duration = Duration::from_secs(5 * 60);
pub const PAGE_SIZE: u32 = 1000;
pub const PEEK_TIMEOUT: Duration = Duration::from_secs(5);
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FetchOptions {
    /// Skip the fast path and re-page from index 0.
    pub force_rescan: bool,
    /// Return every cached transaction instead of the display limit.
    pub ignore_limit: bool,
}

/// Wallet transaction list plus the server pagination cursor it was built
/// from. Lives behind the client's cache lock.
#[derive(Debug, Default)]
pub struct TxCache {
    txs: Vec<Transaction>,
    last_index: u64,
    next_offset: u32,
    last_updated: Option<Instant>,
    dirty: bool,
    limit: u32,
}

impl TxCache {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    pub fn limit(&self, options: FetchOptions) -> usize {
        if options.ignore_limit {
            0
        } else {
            self.limit as usize
        }
    }

    pub fn set_limit(&mut self, limit: u32) {
        self.limit = limit;
        self.dirty = true;
    }

    pub fn invalidate(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn last_index(&self) -> u64 {
        self.last_index
    }

    pub fn next_offset(&self) -> u32 {
        self.next_offset
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    /// Cursor to peek beyond when the fast path may be taken.
    pub fn fast_path_cursor(&self, options: FetchOptions, now: Instant) -> Option<u64> {
        if self.dirty || options.force_rescan {
            return None;
        }
        let updated = self.last_updated?;
        if now.saturating_duration_since(updated) > CACHE_TTL {
            return None;
        }
        Some(self.last_index)
    }

    /// Starting cursor and the entries to merge with for the slow path.
    pub fn resume_point(&self, options: FetchOptions) -> (u64, Vec<Transaction>) {
        if options.force_rescan {
            return (0, Vec::new());
        }
        (self.last_index, self.txs.clone())
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_updated = Some(now);
    }

    pub fn snapshot(&self, limit: usize) -> Vec<Transaction> {
        truncated(&self.txs, limit)
    }

    /// Replaces the cache in one step and returns the stored list.
    pub fn store(&mut self, txs: Vec<Transaction>, last_index: u64, now: Instant) -> &[Transaction] {
        self.txs = txs;
        self.last_index = last_index;
        self.next_offset = u32::try_from(last_index.saturating_add(1)).unwrap_or(u32::MAX);
        self.last_updated = Some(now);
        self.dirty = false;
        &self.txs
    }
}

pub fn truncated(txs: &[Transaction], limit: usize) -> Vec<Transaction> {
    if limit > 0 && txs.len() > limit {
        txs[..limit].to_vec()
    } else {
        txs.to_vec()
    }
}

/// Newest first by timestamp then block height, ties keep input order;
/// duplicates by hash keep the first entry after sorting.
pub fn merge_transactions(existing: Vec<Transaction>, collected: Vec<Transaction>) -> Vec<Transaction> {
    let mut all = existing;
    all.extend(collected);

    all.sort_by(|a, b| match b.time_stamp.cmp(&a.time_stamp) {
        Ordering::Equal => b.block_height.cmp(&a.block_height),
        other => other,
    });

    let mut seen = HashSet::with_capacity(all.len());
    all.retain(|tx| seen.insert(tx.tx_hash.clone()));
    all
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(hash: &str, ts: i64, height: i32, label: &str) -> Transaction {
        Transaction {
            tx_hash: hash.to_string(),
            time_stamp: ts,
            block_height: height,
            label: label.to_string(),
            ..Transaction::default()
        }
    }

    fn hashes(txs: &[Transaction]) -> Vec<&str> {
        txs.iter().map(|tx| tx.tx_hash.as_str()).collect()
    }

    #[test]
    fn merge_sorts_newest_first_with_stable_ties() {
        let existing = vec![tx("a", 100, 10, ""), tx("b", 200, 5, "")];
        let collected = vec![tx("c", 200, 7, ""), tx("d", 100, 10, "")];
        let merged = merge_transactions(existing, collected);
        assert_eq!(hashes(&merged), vec!["c", "b", "a", "d"]);
    }

    #[test]
    fn merge_dedups_across_pages_keeping_first_after_sort() {
        let page_one = vec![tx("a", 300, 3, "old"), tx("b", 200, 2, "")];
        let page_two = vec![tx("a", 300, 3, "new"), tx("c", 100, 1, ""), tx("b", 250, 2, "moved")];
        let merged = merge_transactions(page_one, page_two);

        assert_eq!(hashes(&merged), vec!["a", "b", "c"]);
        assert_eq!(merged[0].label, "old");
        assert_eq!(merged[1].label, "moved");

        let again = merge_transactions(merged.clone(), Vec::new());
        assert_eq!(again, merged);
    }

    #[test]
    fn fast_path_requires_clean_recent_cache() {
        let now = Instant::now();
        let mut cache = TxCache::new(10);
        let opts = FetchOptions::default();
        assert_eq!(cache.fast_path_cursor(opts, now), None);

        cache.store(vec![tx("a", 1, 1, "")], 7, now);
        assert_eq!(cache.fast_path_cursor(opts, now), Some(7));
        assert_eq!(cache.next_offset(), 8);
        assert_eq!(
            cache.fast_path_cursor(
                FetchOptions {
                    force_rescan: true,
                    ..opts
                },
                now
            ),
            None
        );
        assert_eq!(cache.fast_path_cursor(opts, now + CACHE_TTL + Duration::from_secs(1)), None);

        cache.invalidate();
        assert_eq!(cache.fast_path_cursor(opts, now), None);
    }

    #[test]
    fn limit_applies_unless_ignored() {
        let now = Instant::now();
        let mut cache = TxCache::new(2);
        cache.store(
            vec![tx("a", 3, 1, ""), tx("b", 2, 1, ""), tx("c", 1, 1, "")],
            3,
            now,
        );
        let opts = FetchOptions::default();
        assert_eq!(cache.snapshot(cache.limit(opts)).len(), 2);
        let all = FetchOptions {
            ignore_limit: true,
            ..opts
        };
        assert_eq!(cache.snapshot(cache.limit(all)).len(), 3);

        cache.set_limit(5);
        assert!(cache.is_dirty());
    }
}
