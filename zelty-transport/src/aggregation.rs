//! Small-packet aggregation: wire frames below 1 KiB addressed to the
//! same peer are coalesced into a single datagram, flushed when the
//! bucket would overflow `max_aggregation_size` or when the aggregation
//! window expires.

use std::collections::HashMap;
use std::net::SocketAddr;

/// Frames at or above this size bypass aggregation.
pub const AGGREGATION_CUTOFF: usize = 1024;

#[derive(Debug)]
struct Bucket {
    data: Vec<u8>,
    opened_ms: u64,
}

#[derive(Debug)]
pub struct AggregationBuckets {
    buckets: HashMap<SocketAddr, Bucket>,
    max_size: usize,
    window_ms: u64,
}

impl AggregationBuckets {
    pub fn new(max_size: usize, window_ms: u64) -> Self {
        Self {
            buckets: HashMap::new(),
            max_size,
            window_ms,
        }
    }

    /// Queue one wire frame for `addr`. Returns a full datagram to send
    /// now if adding the frame overflowed the open bucket.
    pub fn push(&mut self, addr: SocketAddr, frame: &[u8], now_ms: u64) -> Option<Vec<u8>> {
        let bucket = self.buckets.entry(addr).or_insert_with(|| Bucket {
            data: Vec::with_capacity(self.max_size),
            opened_ms: now_ms,
        });

        let mut flushed = None;
        if !bucket.data.is_empty() && bucket.data.len() + frame.len() > self.max_size {
            flushed = Some(std::mem::take(&mut bucket.data));
            bucket.opened_ms = now_ms;
        }
        bucket.data.extend_from_slice(frame);
        flushed
    }

    /// Drain every bucket whose window has expired.
    pub fn flush_expired(&mut self, now_ms: u64) -> Vec<(SocketAddr, Vec<u8>)> {
        let window_ms = self.window_ms;
        let mut out = Vec::new();
        self.buckets.retain(|addr, bucket| {
            if !bucket.data.is_empty() && now_ms.saturating_sub(bucket.opened_ms) >= window_ms {
                out.push((*addr, std::mem::take(&mut bucket.data)));
            }
            // drop empty buckets so the map does not grow unboundedly
            !bucket.data.is_empty()
        });
        out
    }

    /// Drain everything regardless of age (shutdown path).
    pub fn flush_all(&mut self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.buckets
            .drain()
            .filter(|(_, b)| !b.data.is_empty())
            .map(|(addr, b)| (addr, b.data))
            .collect()
    }

    pub fn drop_peer(&mut self, addr: &SocketAddr) {
        self.buckets.remove(addr);
    }
}
