//! Bounded LRU cache of decoded frames.
//!
//! [`FrameCache`] sits between the playback engine and its [`MediaSource`].
//! Hits refresh recency; misses decode through the source and insert, evicting
//! the least recently used frame once the resident count reaches capacity.
//!
//! Concurrent requests for the same index share one decode: the first caller
//! marks the index in flight and later callers wait on a condition variable
//! until it lands.

use std::collections::HashSet;
use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::{Condvar, Mutex};

use crate::error::FramestepError;
use crate::frame::FrameRef;
use crate::metadata::MediaMetadata;
use crate::source::MediaSource;

/// Counters describing cache behaviour since creation (or the last clear).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Requests served from memory.
    pub hits: u64,
    /// Requests that decoded.
    pub misses: u64,
    /// Frames inserted.
    pub insertions: u64,
    /// Frames evicted to honour the bound.
    pub evictions: u64,
    /// Frames currently resident.
    pub resident: usize,
    /// Highest resident count observed.
    pub peak_resident: usize,
    /// Configured bound.
    pub capacity: usize,
}

struct CacheState {
    entries: LruCache<u64, FrameRef>,
    inflight: HashSet<u64>,
    stats: CacheStats,
}

/// LRU frame cache owning the playback decode context.
pub struct FrameCache {
    source: Mutex<Box<dyn MediaSource>>,
    metadata: MediaMetadata,
    state: Mutex<CacheState>,
    landed: Condvar,
}

impl FrameCache {
    /// Wrap `source` with room for `capacity` frames (minimum 1).
    pub fn new(source: Box<dyn MediaSource>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        let metadata = source.metadata().clone();
        Self {
            source: Mutex::new(source),
            metadata,
            state: Mutex::new(CacheState {
                entries: LruCache::new(capacity),
                inflight: HashSet::new(),
                stats: CacheStats {
                    capacity: capacity.get(),
                    ..CacheStats::default()
                },
            }),
            landed: Condvar::new(),
        }
    }

    pub fn metadata(&self) -> &MediaMetadata {
        &self.metadata
    }

    /// Return the frame at `frame_index`, decoding it on a miss.
    ///
    /// # Errors
    ///
    /// [`FramestepError::FrameOutOfRange`] past the last frame; otherwise only
    /// errors produced by the underlying source.
    pub fn get_frame(&self, frame_index: u64) -> Result<FrameRef, FramestepError> {
        if frame_index >= self.metadata.frame_count {
            return Err(FramestepError::FrameOutOfRange {
                frame_index,
                frame_count: self.metadata.frame_count,
            });
        }

        {
            let mut state = self.state.lock();
            loop {
                if let Some(frame) = state.entries.get(&frame_index).cloned() {
                    state.stats.hits += 1;
                    return Ok(frame);
                }
                if !state.inflight.contains(&frame_index) {
                    break;
                }
                self.landed.wait(&mut state);
            }
            state.inflight.insert(frame_index);
            state.stats.misses += 1;
        }

        log::trace!("Cache miss for frame {frame_index}");
        let result = self.source.lock().decode_at(frame_index);

        let mut state = self.state.lock();
        state.inflight.remove(&frame_index);
        if let Ok(frame) = &result {
            if state.entries.push(frame_index, frame.clone()).is_some() {
                state.stats.evictions += 1;
            }
            state.stats.insertions += 1;
            state.stats.resident = state.entries.len();
            state.stats.peak_resident = state.stats.peak_resident.max(state.stats.resident);
        }
        drop(state);
        self.landed.notify_all();

        result
    }

    /// Position the source on the last frame at or before `timestamp`.
    ///
    /// Returns the landing index; fetch the frame with
    /// [`get_frame`](FrameCache::get_frame).
    pub fn seek_near(&self, timestamp: f64) -> Result<u64, FramestepError> {
        self.source.lock().seek_near(timestamp)
    }

    /// `true` if `frame_index` is resident. Does not touch recency.
    pub fn contains(&self, frame_index: u64) -> bool {
        self.state.lock().entries.contains(&frame_index)
    }

    /// Resident frame count.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().stats.capacity
    }

    pub fn stats(&self) -> CacheStats {
        self.state.lock().stats
    }

    /// Drop every resident frame and reset the counters.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        let capacity = state.stats.capacity;
        state.stats = CacheStats {
            capacity,
            ..CacheStats::default()
        };
    }
}
