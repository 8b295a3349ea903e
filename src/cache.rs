//! A shared, sharded LRU cache for inference results.
//!
//! Entries are keyed by the position canonicalized under its canonical
//! symmetry, so the 8 dihedral variants of a position share one entry. Each
//! entry stores the model output in canonical-symmetry space together with a
//! bitmask of which of the 8 inference symmetries have been observed;
//! observing a new symmetry merges it into a running average, so repeated
//! queries return progressively better estimates.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::constants::{NUM_MOVES, NUM_POINTS};
use crate::coord::Coord;
use crate::model::ModelOutput;
use crate::position::Position;
use crate::symmetry::{self, Symmetry};
use crate::zobrist::{self, Hash};

/// Cache key: a canonicalized position hash plus the canonicalized stone
/// hash. There is a vanishingly small chance that two positions collide on
/// `cache_hash` alone, so equality compares both; `cache_hash` is
/// sufficient for the hash value itself.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CacheKey {
    cache_hash: Hash,
    stone_hash: Hash,
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.cache_hash.hash(state);
    }
}

impl CacheKey {
    /// Builds a key from a position and the move that produced it. Mixes:
    /// the stones and the superko-aware legality of every empty point
    /// (visited in canonical orientation), the side to play, and whether
    /// the previous move was a pass.
    pub fn new(prev_move: Coord, canonical_sym: Symmetry, position: &Position) -> CacheKey {
        let mut cache_hash = zobrist::to_play_hash(position.to_play());
        if prev_move == Coord::PASS {
            cache_hash ^= zobrist::opponent_passed_hash();
        }
        let mut stone_hash = 0;
        for i in 0..NUM_POINTS {
            let real_c = Coord::from_index(i);
            let canonical_c = canonical_sym.apply_coord(real_c);
            let color = position.stones()[i].color();
            let h = zobrist::move_hash(canonical_c, color);
            stone_hash ^= h;
            cache_hash ^= h;
            if position.stones()[i].is_empty() && !position.legal_move(real_c) {
                cache_hash ^= zobrist::illegal_empty_point_hash(canonical_c);
            }
        }
        CacheKey {
            cache_hash,
            stone_hash,
        }
    }

    /// Constructs a key directly. Provided to make testing possible.
    pub fn create_test_key(cache_hash: Hash, stone_hash: Hash) -> CacheKey {
        CacheKey {
            cache_hash,
            stone_hash,
        }
    }

    pub fn shard(&self, num_shards: usize) -> usize {
        (self.cache_hash % num_shards as u64) as usize
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}:{:016x}", self.cache_hash, self.stone_hash)
    }
}

#[derive(Copy, Clone, Default, Debug)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub num_hits: u64,
    pub num_complete_misses: u64,
    pub num_symmetry_misses: u64,
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let num_lookups = self.num_hits + self.num_complete_misses + self.num_symmetry_misses;
        let hit_rate = self.num_hits as f32 / (num_lookups.max(1)) as f32;
        let full = self.size as f32 / self.capacity.max(1) as f32;
        write!(
            f,
            "size:{} capacity:{} full:{:.1}% hits:{} complete_misses:{} symmetry_misses:{} \
             hit_rate:{:.1}%",
            self.size,
            self.capacity,
            100.0 * full,
            self.num_hits,
            self.num_complete_misses,
            self.num_symmetry_misses,
            100.0 * hit_rate
        )
    }
}

/// Shared cache capability. Shards (if any) are individually locked; there
/// is no cross-shard consistency.
pub trait InferenceCache: Send + Sync {
    fn clear(&self);

    /// Merges a fresh inference result for `key` into the cache and
    /// rewrites `output` with the (possibly averaged) cached estimate, so
    /// repeated queries under any symmetry converge on the same value.
    fn merge(
        &self,
        key: CacheKey,
        canonical_sym: Symmetry,
        inference_sym: Symmetry,
        output: &mut ModelOutput,
    );

    /// Looks up `key`. Returns false on a miss or when the requested
    /// inference symmetry hasn't been observed for the entry yet. On a hit,
    /// stores the cached output (transformed back to board space) in
    /// `output`.
    fn try_get(
        &self,
        key: CacheKey,
        canonical_sym: Symmetry,
        inference_sym: Symmetry,
        output: &mut ModelOutput,
    ) -> bool;

    fn stats(&self) -> CacheStats;
}

const NIL: u32 = u32::MAX;

struct Entry {
    key: CacheKey,
    /// Model output in canonical-symmetry space.
    output: ModelOutput,
    valid_symmetry_bits: u8,
    num_valid_symmetries: u8,
    prev: u32,
    next: u32,
}

/// Single-shard LRU cache. Not thread safe; [`ShardedInferenceCache`] wraps
/// it with per-shard locks.
pub struct BasicInferenceCache {
    map: HashMap<CacheKey, u32>,
    entries: Vec<Entry>,
    free: Vec<u32>,
    /// Most recently used entry, or NIL.
    head: u32,
    /// Least recently used entry, or NIL.
    tail: u32,
    stats: CacheStats,
}

/// The symmetry that maps an entry's canonical space to the orientation the
/// model actually saw.
fn canonical_inference_sym(canonical_sym: Symmetry, inference_sym: Symmetry) -> Symmetry {
    canonical_sym.inverse().concat(inference_sym)
}

impl BasicInferenceCache {
    /// Approximates how many entries fit in `size_mb` MiB, assuming the hash
    /// map's worst-case load factor.
    pub fn calculate_capacity(size_mb: usize) -> usize {
        let load_factor = 0.4375;
        let element_size = (std::mem::size_of::<(CacheKey, Entry)>()
            + NUM_MOVES * std::mem::size_of::<f32>()) as f32
            + (std::mem::size_of::<usize>() + 1) as f32 / load_factor;
        (size_mb as f32 * 1024.0 * 1024.0 / element_size) as usize
    }

    pub fn new(capacity: usize) -> BasicInferenceCache {
        assert!(capacity > 0, "inference cache capacity must be positive");
        BasicInferenceCache {
            map: HashMap::with_capacity(capacity.min(1 << 20)),
            entries: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            stats: CacheStats {
                capacity,
                ..CacheStats::default()
            },
        }
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.entries.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
        self.stats.size = 0;
    }

    fn unlink(&mut self, idx: u32) {
        let (prev, next) = {
            let e = &self.entries[idx as usize];
            (e.prev, e.next)
        };
        if prev != NIL {
            self.entries[prev as usize].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.entries[next as usize].prev = prev;
        } else {
            self.tail = prev;
        }
    }

    fn push_front(&mut self, idx: u32) {
        let old_head = self.head;
        {
            let e = &mut self.entries[idx as usize];
            e.prev = NIL;
            e.next = old_head;
        }
        if old_head != NIL {
            self.entries[old_head as usize].prev = idx;
        } else {
            self.tail = idx;
        }
        self.head = idx;
    }

    pub fn merge(
        &mut self,
        key: CacheKey,
        canonical_sym: Symmetry,
        inference_sym: Symmetry,
        output: &mut ModelOutput,
    ) {
        let sym_bit = 1u8 << canonical_inference_sym(canonical_sym, inference_sym) as u8;

        if let Some(&idx) = self.map.get(&key) {
            self.unlink(idx);

            if self.entries[idx as usize].valid_symmetry_bits & sym_bit == 0 {
                // A new symmetry for this key: fold it into the running
                // average in canonical space.
                let mut canonical_policy = vec![0.0f32; NUM_MOVES];
                symmetry::apply_policy(canonical_sym, &output.policy, &mut canonical_policy);

                let entry = &mut self.entries[idx as usize];
                let n = entry.num_valid_symmetries as f32;
                let a = n / (n + 1.0);
                let b = 1.0 / (n + 1.0);
                for (cached, new) in entry.output.policy.iter_mut().zip(&canonical_policy) {
                    *cached = a * *cached + b * *new;
                }
                entry.output.value = a * entry.output.value + b * output.value;
                entry.valid_symmetry_bits |= sym_bit;
                entry.num_valid_symmetries += 1;
            }

            // Hand the (merged) cached estimate back in board space.
            let entry = &self.entries[idx as usize];
            symmetry::apply_policy(
                canonical_sym.inverse(),
                &entry.output.policy,
                &mut output.policy,
            );
            output.value = entry.output.value;
            self.push_front(idx);
            return;
        }

        // Insert a new entry, evicting the least recently used one if the
        // cache is full.
        if self.map.len() >= self.stats.capacity {
            let lru = self.tail;
            debug_assert_ne!(lru, NIL);
            self.unlink(lru);
            let old_key = self.entries[lru as usize].key;
            self.map.remove(&old_key);
            self.free.push(lru);
        } else {
            self.stats.size += 1;
        }

        let mut canonical_output = ModelOutput {
            policy: vec![0.0; NUM_MOVES],
            value: output.value,
        };
        symmetry::apply_policy(canonical_sym, &output.policy, &mut canonical_output.policy);

        let entry = Entry {
            key,
            output: canonical_output,
            valid_symmetry_bits: sym_bit,
            num_valid_symmetries: 1,
            prev: NIL,
            next: NIL,
        };
        let idx = if let Some(idx) = self.free.pop() {
            self.entries[idx as usize] = entry;
            idx
        } else {
            self.entries.push(entry);
            (self.entries.len() - 1) as u32
        };
        self.map.insert(key, idx);
        self.push_front(idx);
    }

    pub fn try_get(
        &mut self,
        key: CacheKey,
        canonical_sym: Symmetry,
        inference_sym: Symmetry,
        output: &mut ModelOutput,
    ) -> bool {
        let Some(&idx) = self.map.get(&key) else {
            self.stats.num_complete_misses += 1;
            return false;
        };

        self.unlink(idx);
        self.push_front(idx);

        let sym_bit = 1u8 << canonical_inference_sym(canonical_sym, inference_sym) as u8;
        if self.entries[idx as usize].valid_symmetry_bits & sym_bit == 0 {
            // Some symmetries are cached for this position, just not the
            // requested one.
            self.stats.num_symmetry_misses += 1;
            return false;
        }

        let entry = &self.entries[idx as usize];
        symmetry::apply_policy(
            canonical_sym.inverse(),
            &entry.output.policy,
            &mut output.policy,
        );
        output.value = entry.output.value;
        self.stats.num_hits += 1;
        true
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}

/// Thread safe cache sharded by `cache_hash`. Each shard holds its own lock
/// and an independent LRU list, which keeps contention low when many games
/// run in parallel.
pub struct ShardedInferenceCache {
    shards: Vec<Mutex<BasicInferenceCache>>,
}

impl ShardedInferenceCache {
    /// `total_capacity` is split evenly across `num_shards` shards (fixed at
    /// construction).
    pub fn new(total_capacity: usize, num_shards: usize) -> ShardedInferenceCache {
        assert!(num_shards > 0);
        let mut shards = Vec::with_capacity(num_shards);
        let mut allocated = 0;
        for i in 0..num_shards {
            let a = i * total_capacity / num_shards;
            let b = (i + 1) * total_capacity / num_shards;
            allocated += b - a;
            shards.push(Mutex::new(BasicInferenceCache::new(b - a)));
        }
        assert_eq!(allocated, total_capacity);
        ShardedInferenceCache { shards }
    }

    fn shard(&self, key: &CacheKey) -> &Mutex<BasicInferenceCache> {
        &self.shards[key.shard(self.shards.len())]
    }
}

impl InferenceCache for ShardedInferenceCache {
    /// Each shard is locked and cleared in turn: concurrent `merge` calls
    /// may mean there is never a point in time where the whole cache is
    /// empty (unless there is a single shard).
    fn clear(&self) {
        for shard in &self.shards {
            shard.lock().unwrap().clear();
        }
    }

    fn merge(
        &self,
        key: CacheKey,
        canonical_sym: Symmetry,
        inference_sym: Symmetry,
        output: &mut ModelOutput,
    ) {
        self.shard(&key)
            .lock()
            .unwrap()
            .merge(key, canonical_sym, inference_sym, output);
    }

    fn try_get(
        &self,
        key: CacheKey,
        canonical_sym: Symmetry,
        inference_sym: Symmetry,
        output: &mut ModelOutput,
    ) -> bool {
        self.shard(&key)
            .lock()
            .unwrap()
            .try_get(key, canonical_sym, inference_sym, output)
    }

    fn stats(&self) -> CacheStats {
        let mut result = CacheStats::default();
        for shard in &self.shards {
            let s = shard.lock().unwrap().stats();
            result.size += s.size;
            result.capacity += s.capacity;
            result.num_hits += s.num_hits;
            result.num_complete_misses += s.num_complete_misses;
            result.num_symmetry_misses += s.num_symmetry_misses;
        }
        result
    }
}

/// Cache used when caching is disabled: never stores anything.
pub struct NullInferenceCache;

impl InferenceCache for NullInferenceCache {
    fn clear(&self) {}

    fn merge(
        &self,
        _key: CacheKey,
        _canonical_sym: Symmetry,
        _inference_sym: Symmetry,
        _output: &mut ModelOutput,
    ) {
    }

    fn try_get(
        &self,
        _key: CacheKey,
        _canonical_sym: Symmetry,
        _inference_sym: Symmetry,
        _output: &mut ModelOutput,
    ) -> bool {
        false
    }

    fn stats(&self) -> CacheStats {
        CacheStats::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::Color;
    use crate::symmetry::ALL_SYMMETRIES;

    fn output_with(policy_idx: usize, value: f32) -> ModelOutput {
        let mut output = ModelOutput::default();
        output.policy[policy_idx] = 1.0;
        output.value = value;
        output
    }

    #[test]
    fn test_miss_then_hit() {
        let mut cache = BasicInferenceCache::new(8);
        let key = CacheKey::create_test_key(1, 2);
        let mut output = ModelOutput::default();
        assert!(!cache.try_get(key, Symmetry::Identity, Symmetry::Identity, &mut output));

        let mut stored = output_with(5, 0.5);
        cache.merge(key, Symmetry::Identity, Symmetry::Identity, &mut stored);

        let mut fetched = ModelOutput::default();
        assert!(cache.try_get(key, Symmetry::Identity, Symmetry::Identity, &mut fetched));
        assert_eq!(fetched.policy[5], 1.0);
        assert_eq!(fetched.value, 0.5);

        let stats = cache.stats();
        assert_eq!(stats.num_hits, 1);
        assert_eq!(stats.num_complete_misses, 1);
    }

    #[test]
    fn test_symmetry_miss_is_not_a_hit() {
        let mut cache = BasicInferenceCache::new(8);
        let key = CacheKey::create_test_key(1, 2);
        let mut stored = output_with(5, 0.5);
        cache.merge(key, Symmetry::Identity, Symmetry::Identity, &mut stored);

        let mut fetched = ModelOutput::default();
        assert!(!cache.try_get(key, Symmetry::Identity, Symmetry::Rot90, &mut fetched));
        assert_eq!(cache.stats().num_symmetry_misses, 1);

        // Merging the second symmetry makes it a hit.
        let mut stored2 = output_with(5, 0.7);
        cache.merge(key, Symmetry::Identity, Symmetry::Rot90, &mut stored2);
        assert!(cache.try_get(key, Symmetry::Identity, Symmetry::Rot90, &mut fetched));
    }

    #[test]
    fn test_merge_averages_value() {
        let mut cache = BasicInferenceCache::new(8);
        let key = CacheKey::create_test_key(1, 2);

        let mut first = output_with(0, 1.0);
        cache.merge(key, Symmetry::Identity, Symmetry::Identity, &mut first);
        assert_eq!(first.value, 1.0);

        let mut second = output_with(0, 0.0);
        cache.merge(key, Symmetry::Identity, Symmetry::Rot90, &mut second);
        // Running average over the two observed symmetries.
        assert!((second.value - 0.5).abs() < 1e-6);

        // A repeat of an already-observed symmetry does not re-merge.
        let mut third = output_with(0, -1.0);
        cache.merge(key, Symmetry::Identity, Symmetry::Identity, &mut third);
        assert!((third.value - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_lru_eviction_order() {
        let mut cache = BasicInferenceCache::new(2);
        let k1 = CacheKey::create_test_key(1, 1);
        let k2 = CacheKey::create_test_key(2, 2);
        let k3 = CacheKey::create_test_key(3, 3);
        let mut output = ModelOutput::default();

        cache.merge(k1, Symmetry::Identity, Symmetry::Identity, &mut output);
        cache.merge(k2, Symmetry::Identity, Symmetry::Identity, &mut output);
        // Touch k1 so k2 becomes least recently used.
        assert!(cache.try_get(k1, Symmetry::Identity, Symmetry::Identity, &mut output));
        cache.merge(k3, Symmetry::Identity, Symmetry::Identity, &mut output);

        assert!(cache.try_get(k1, Symmetry::Identity, Symmetry::Identity, &mut output));
        assert!(!cache.try_get(k2, Symmetry::Identity, Symmetry::Identity, &mut output));
        assert!(cache.try_get(k3, Symmetry::Identity, Symmetry::Identity, &mut output));
        assert_eq!(cache.stats().size, 2);
    }

    #[test]
    fn test_policy_round_trips_through_canonical_space() {
        // Store under one symmetry, read back under the same symmetry with a
        // non-identity canonical transform; the policy must be unchanged.
        let mut cache = BasicInferenceCache::new(8);
        let key = CacheKey::create_test_key(9, 9);
        let canonical = Symmetry::Rot90;

        let mut stored = output_with(3, 0.25);
        cache.merge(key, canonical, Symmetry::Flip, &mut stored);
        assert_eq!(stored.policy[3], 1.0);

        let mut fetched = ModelOutput::default();
        assert!(cache.try_get(key, canonical, Symmetry::Flip, &mut fetched));
        assert_eq!(fetched.policy[3], 1.0);
        assert_eq!(fetched.value, 0.25);
    }

    #[test]
    fn test_cache_key_symmetry_invariance() {
        // A position and its rotation produce the same cache key when each
        // is canonicalized by its own canonical symmetry.
        use crate::mcts::calculate_canonical_symmetry;

        let mut pos = Position::new(Color::Black);
        pos.play_move(Coord::from_row_col(0, 1), Some(Color::Black), None);
        pos.play_move(Coord::from_row_col(2, 4), Some(Color::White), None);
        let key_sym = calculate_canonical_symmetry(&pos).expect("canonical symmetry expected");

        for &sym in &ALL_SYMMETRIES {
            let mut transformed = Position::new(Color::Black);
            transformed.play_move(
                sym.apply_coord(Coord::from_row_col(0, 1)),
                Some(Color::Black),
                None,
            );
            transformed.play_move(
                sym.apply_coord(Coord::from_row_col(2, 4)),
                Some(Color::White),
                None,
            );
            let t_sym = calculate_canonical_symmetry(&transformed)
                .expect("canonical symmetry expected");

            let key_a = CacheKey::new(Coord::from_row_col(2, 4), key_sym, &pos);
            let key_b = CacheKey::new(
                sym.apply_coord(Coord::from_row_col(2, 4)),
                t_sym,
                &transformed,
            );
            assert_eq!(key_a, key_b, "key mismatch under {:?}", sym);
        }
    }

    #[test]
    fn test_sharded_cache_basic() {
        let cache = ShardedInferenceCache::new(64, 8);
        let mut output = output_with(1, 0.5);
        let key = CacheKey::create_test_key(42, 42);
        cache.merge(key, Symmetry::Identity, Symmetry::Identity, &mut output);

        let mut fetched = ModelOutput::default();
        assert!(cache.try_get(key, Symmetry::Identity, Symmetry::Identity, &mut fetched));
        assert_eq!(fetched.policy[1], 1.0);
        assert_eq!(cache.stats().size, 1);
        assert_eq!(cache.stats().capacity, 64);

        cache.clear();
        assert!(!cache.try_get(key, Symmetry::Identity, Symmetry::Identity, &mut fetched));
    }

    #[test]
    fn test_capacity_estimate_is_sane() {
        let capacity = BasicInferenceCache::calculate_capacity(32);
        assert!(capacity > 1000);
        assert!(capacity < 32 * 1024 * 1024);
    }
}
