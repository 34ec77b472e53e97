//! Copy-on-write table of the chunks a shard owns.
//!
//! ```text
//!   chunks:  [0,10) [10,20) [30,40)
//!   ranges:  [0,20)         [30,40)
//! ```
//!
//! Every chunk is contained in exactly one range, and ranges are the maximal
//! runs of adjacent chunks. Tables are never mutated: `clone_plus`,
//! `clone_minus` and `clone_split` return a new table, leaving the source
//! usable by concurrent readers.

use super::key::{Document, ShardKey, ShardKeyPattern};
use super::metadata::ConfigMetadataSource;
use super::version::ChunkVersion;
use crate::error::ChunkError;
use crate::types::ShardId;
use std::collections::BTreeMap;

type ChunkResult<T> = std::result::Result<T, ChunkError>;

/// Ordered, coalesced map of the key ranges owned by one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRangeTable {
    pattern: ShardKeyPattern,
    /// min -> max of each owned chunk.
    chunks: BTreeMap<ShardKey, ShardKey>,
    /// min -> max of each coalesced range.
    ranges: BTreeMap<ShardKey, ShardKey>,
    version: ChunkVersion,
}

impl ChunkRangeTable {
    /// A table that owns nothing, at version zero.
    pub fn empty(pattern: ShardKeyPattern) -> Self {
        Self {
            pattern,
            chunks: BTreeMap::new(),
            ranges: BTreeMap::new(),
            version: ChunkVersion::ZERO,
        }
    }

    /// Build a table from `(min, max)` chunk bounds.
    ///
    /// Chunks may arrive in any order but must be valid and pairwise disjoint.
    pub fn from_chunks<I>(
        pattern: ShardKeyPattern,
        chunks: I,
        version: ChunkVersion,
    ) -> ChunkResult<Self>
    where
        I: IntoIterator<Item = (ShardKey, ShardKey)>,
    {
        let mut map = BTreeMap::new();
        for (min, max) in chunks {
            validate_range(&pattern, &min, &max)?;
            if let Some((existing_min, existing_max)) = find_overlap(&map, &min, &max) {
                return Err(ChunkError::RangeOverlap {
                    existing_min: existing_min.clone(),
                    existing_max: existing_max.clone(),
                    min,
                    max,
                });
            }
            map.insert(min, max);
        }
        Ok(Self::build(pattern, map, version))
    }

    /// Load the chunks `shard` owns for `ns` from the config metadata.
    ///
    /// The version is the greatest `lastmod` among those chunks, or zero when
    /// the shard owns none.
    pub fn load(
        source: &dyn ConfigMetadataSource,
        ns: &str,
        shard: &ShardId,
    ) -> ChunkResult<Self> {
        let collection = source.collection(ns)?;
        if collection.dropped {
            return Err(ChunkError::CollectionDropped(ns.to_string()));
        }

        let chunks = source.chunks(ns, shard)?;
        let version = chunks
            .iter()
            .map(|c| c.lastmod)
            .max()
            .unwrap_or(ChunkVersion::ZERO);

        tracing::debug!(
            ns = ns,
            shard = %shard,
            chunks = chunks.len(),
            version = %version,
            "Loaded chunk metadata"
        );

        Self::from_chunks(
            collection.pattern,
            chunks.into_iter().map(|c| (c.min, c.max)),
            version,
        )
    }

    fn build(
        pattern: ShardKeyPattern,
        chunks: BTreeMap<ShardKey, ShardKey>,
        version: ChunkVersion,
    ) -> Self {
        let ranges = coalesce(&chunks);
        Self {
            pattern,
            chunks,
            ranges,
            version,
        }
    }

    pub fn pattern(&self) -> &ShardKeyPattern {
        &self.pattern
    }

    pub fn version(&self) -> ChunkVersion {
        self.version
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Whether this shard owns no chunks.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Owned chunks in key order.
    pub fn chunks(&self) -> impl Iterator<Item = (&ShardKey, &ShardKey)> {
        self.chunks.iter()
    }

    /// Coalesced ranges in key order.
    pub fn ranges(&self) -> impl Iterator<Item = (&ShardKey, &ShardKey)> {
        self.ranges.iter()
    }

    /// Whether `key` falls inside a range this shard owns.
    ///
    /// Keys that do not match the shard key pattern are never owned.
    pub fn belongs_to_me(&self, key: &ShardKey) -> bool {
        if !self.pattern.is_shard_key(key) {
            return false;
        }
        // Greatest range min <= key; none means key sorts before every range.
        match self.ranges.range(..=key).next_back() {
            Some((_, max)) => key < max,
            None => false,
        }
    }

    /// Whether the document's shard key falls inside a range this shard owns.
    pub fn belongs_to_me_doc(&self, doc: &Document) -> bool {
        self.belongs_to_me(&self.pattern.extract(doc))
    }

    /// The owned chunk containing `lookup`, or else the first owned chunk
    /// starting after it.
    pub fn next_chunk(&self, lookup: &ShardKey) -> Option<(&ShardKey, &ShardKey)> {
        if let Some((min, max)) = self.chunks.range(..=lookup).next_back() {
            if lookup < max {
                return Some((min, max));
            }
        }
        self.chunks.range(lookup..).next()
    }

    fn check_version(&self, new_version: ChunkVersion) -> ChunkResult<()> {
        if new_version <= self.version {
            return Err(ChunkError::VersionNotMonotonic {
                current: self.version,
                requested: new_version,
            });
        }
        Ok(())
    }

    fn check_chunk_exists(&self, min: &ShardKey, max: &ShardKey) -> ChunkResult<()> {
        match self.chunks.get(min) {
            None => Err(ChunkError::ChunkNotFound {
                min: min.clone(),
                max: max.clone(),
            }),
            Some(found_max) if found_max != max => Err(ChunkError::RangeMismatch {
                min: min.clone(),
                expected_max: max.clone(),
                found_max: found_max.clone(),
            }),
            Some(_) => Ok(()),
        }
    }

    /// New table without the chunk `[min, max)`, at `new_version`.
    pub fn clone_minus(
        &self,
        min: &ShardKey,
        max: &ShardKey,
        new_version: ChunkVersion,
    ) -> ChunkResult<Self> {
        self.check_version(new_version)?;
        self.check_chunk_exists(min, max)?;

        let mut chunks = self.chunks.clone();
        chunks.remove(min);
        Ok(Self::build(self.pattern.clone(), chunks, new_version))
    }

    /// New table with the chunk `[min, max)` added, at `new_version`.
    pub fn clone_plus(
        &self,
        min: &ShardKey,
        max: &ShardKey,
        new_version: ChunkVersion,
    ) -> ChunkResult<Self> {
        self.check_version(new_version)?;
        validate_range(&self.pattern, min, max)?;

        if let Some((existing_min, existing_max)) = find_overlap(&self.ranges, min, max) {
            return Err(ChunkError::RangeOverlap {
                min: min.clone(),
                max: max.clone(),
                existing_min: existing_min.clone(),
                existing_max: existing_max.clone(),
            });
        }

        let mut chunks = self.chunks.clone();
        chunks.insert(min.clone(), max.clone());
        Ok(Self::build(self.pattern.clone(), chunks, new_version))
    }

    /// New table with the chunk `[min, max)` split at `split_keys`.
    ///
    /// Split keys must lie strictly inside the chunk and be strictly
    /// increasing. The resulting version is `new_version` with its minor
    /// bumped once per split key.
    pub fn clone_split(
        &self,
        min: &ShardKey,
        max: &ShardKey,
        split_keys: &[ShardKey],
        new_version: ChunkVersion,
    ) -> ChunkResult<Self> {
        self.check_version(new_version)?;
        self.check_chunk_exists(min, max)?;

        let mut lower = min;
        for key in split_keys {
            if !self.pattern.is_shard_key(key) || key <= lower || key >= max {
                return Err(ChunkError::InvalidSplitKey {
                    min: min.clone(),
                    max: max.clone(),
                    key: key.clone(),
                });
            }
            lower = key;
        }

        let mut chunks = self.chunks.clone();
        let mut version = new_version;
        let mut start = min.clone();
        for key in split_keys {
            chunks.insert(start, key.clone());
            start = key.clone();
            version = version
                .inc_minor()
                .ok_or(ChunkError::VersionOverflow { version })?;
        }
        chunks.insert(start, max.clone());

        Ok(Self::build(self.pattern.clone(), chunks, version))
    }
}

fn validate_range(pattern: &ShardKeyPattern, min: &ShardKey, max: &ShardKey) -> ChunkResult<()> {
    if !pattern.is_shard_key(min) {
        return Err(ChunkError::KeyPatternMismatch(min.clone()));
    }
    if !pattern.is_shard_key(max) {
        return Err(ChunkError::KeyPatternMismatch(max.clone()));
    }
    if min >= max {
        return Err(ChunkError::InvalidRange {
            min: min.clone(),
            max: max.clone(),
        });
    }
    Ok(())
}

/// Find an entry of a disjoint range map intersecting `[min, max)`.
///
/// Only the last entry starting before `max` can intersect: it has the
/// largest upper bound among all candidates.
fn find_overlap<'a>(
    map: &'a BTreeMap<ShardKey, ShardKey>,
    min: &ShardKey,
    max: &ShardKey,
) -> Option<(&'a ShardKey, &'a ShardKey)> {
    map.range(..max)
        .next_back()
        .filter(|(_, existing_max)| *existing_max > min)
}

/// Merge adjacent chunks into maximal ranges.
fn coalesce(chunks: &BTreeMap<ShardKey, ShardKey>) -> BTreeMap<ShardKey, ShardKey> {
    let mut ranges = BTreeMap::new();
    let mut iter = chunks.iter();
    let Some((first_min, first_max)) = iter.next() else {
        return ranges;
    };

    let mut run_min = first_min.clone();
    let mut run_max = first_max.clone();
    for (min, max) in iter {
        if *min == run_max {
            run_max = max.clone();
        } else {
            let next_min = min.clone();
            ranges.insert(std::mem::replace(&mut run_min, next_min), run_max);
            run_max = max.clone();
        }
    }
    ranges.insert(run_min, run_max);
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharding::key::KeyValue;
    use crate::sharding::metadata::{ChunkMetadata, InMemoryConfigMetadata};
    use proptest::prelude::*;

    fn pattern() -> ShardKeyPattern {
        ShardKeyPattern::new(["x"])
    }

    fn k(v: i64) -> ShardKey {
        ShardKey::from(v)
    }

    fn v(major: u32, minor: u32) -> ChunkVersion {
        ChunkVersion::new(major, minor)
    }

    fn table(chunks: &[(i64, i64)], version: ChunkVersion) -> ChunkRangeTable {
        ChunkRangeTable::from_chunks(
            pattern(),
            chunks.iter().map(|&(a, b)| (k(a), k(b))),
            version,
        )
        .unwrap()
    }

    fn ranges_of(t: &ChunkRangeTable) -> Vec<(ShardKey, ShardKey)> {
        t.ranges().map(|(a, b)| (a.clone(), b.clone())).collect()
    }

    /// Ranges are disjoint and each one is a maximal run of adjacent chunks.
    fn assert_range_invariant(t: &ChunkRangeTable) {
        let chunks: Vec<_> = t.chunks().collect();
        let mut expected: Vec<(ShardKey, ShardKey)> = Vec::new();
        for (min, max) in chunks {
            match expected.last_mut() {
                Some((_, run_max)) if run_max == min => *run_max = max.clone(),
                _ => expected.push((min.clone(), max.clone())),
            }
        }
        assert_eq!(ranges_of(t), expected);
        for pair in expected.windows(2) {
            assert!(pair[0].1 < pair[1].0);
        }
    }

    #[test]
    fn test_end_to_end_scenario() {
        let t = table(&[(0, 10)], v(1, 0));

        let plus = t.clone_plus(&k(10), &k(20), v(1, 1)).unwrap();
        assert_eq!(ranges_of(&plus), vec![(k(0), k(20))]);
        assert_eq!(plus.version(), v(1, 1));

        let minus = plus.clone_minus(&k(0), &k(10), v(2, 0)).unwrap();
        assert_eq!(ranges_of(&minus), vec![(k(10), k(20))]);
        assert_eq!(minus.version(), v(2, 0));
        assert!(!minus.belongs_to_me(&k(5)));
        assert!(minus.belongs_to_me(&k(15)));

        // Sources are untouched.
        assert_eq!(t.num_chunks(), 1);
        assert_eq!(plus.num_chunks(), 2);
    }

    #[test]
    fn test_adjacent_chunks_coalesce() {
        let t = table(&[(0, 10), (20, 30)], v(1, 0));
        assert_eq!(ranges_of(&t).len(), 2);

        let t = t.clone_plus(&k(10), &k(20), v(1, 1)).unwrap();
        assert_eq!(ranges_of(&t), vec![(k(0), k(30))]);
        assert_eq!(t.num_chunks(), 3);
    }

    #[test]
    fn test_overlap_rejected() {
        let t = table(&[(0, 10)], v(1, 0));
        let err = t.clone_plus(&k(5), &k(15), v(1, 1)).unwrap_err();
        assert_eq!(
            err,
            ChunkError::RangeOverlap {
                min: k(5),
                max: k(15),
                existing_min: k(0),
                existing_max: k(10),
            }
        );

        // Enclosing and enclosed candidates overlap too.
        assert!(t.clone_plus(&k(-5), &k(50), v(1, 1)).is_err());
        assert!(t.clone_plus(&k(2), &k(3), v(1, 1)).is_err());
        // Touching is fine.
        assert!(t.clone_plus(&k(-5), &k(0), v(1, 1)).is_ok());
    }

    #[test]
    fn test_version_must_increase() {
        let t = table(&[(0, 10)], v(1, 0));
        let v1 = v(1, 1);
        let v2 = v(1, 2);
        let v3 = v(2, 0);

        let t1 = t.clone_plus(&k(10), &k(20), v1).unwrap();
        let t3 = t1.clone_plus(&k(20), &k(30), v3).unwrap();
        let err = t3.clone_minus(&k(0), &k(10), v2).unwrap_err();
        assert_eq!(
            err,
            ChunkError::VersionNotMonotonic {
                current: v3,
                requested: v2
            }
        );

        assert!(t.clone_plus(&k(10), &k(20), v(1, 0)).is_err());
        assert!(t.clone_minus(&k(0), &k(10), v(0, 5)).is_err());
    }

    #[test]
    fn test_clone_minus_requires_exact_chunk() {
        let t = table(&[(0, 10), (10, 20)], v(1, 0));

        assert_eq!(
            t.clone_minus(&k(5), &k(10), v(2, 0)).unwrap_err(),
            ChunkError::ChunkNotFound {
                min: k(5),
                max: k(10)
            }
        );
        assert_eq!(
            t.clone_minus(&k(0), &k(20), v(2, 0)).unwrap_err(),
            ChunkError::RangeMismatch {
                min: k(0),
                expected_max: k(20),
                found_max: k(10)
            }
        );

        let t = t.clone_minus(&k(10), &k(20), v(2, 0)).unwrap();
        let t = t.clone_minus(&k(0), &k(10), v(3, 0)).unwrap();
        assert!(t.is_empty());
        assert_eq!(t.version(), v(3, 0));
        assert!(!t.belongs_to_me(&k(0)));
    }

    #[test]
    fn test_invalid_ranges() {
        let t = ChunkRangeTable::empty(pattern());
        assert!(matches!(
            t.clone_plus(&k(10), &k(10), v(1, 0)),
            Err(ChunkError::InvalidRange { .. })
        ));
        assert!(matches!(
            t.clone_plus(&k(10), &k(0), v(1, 0)),
            Err(ChunkError::InvalidRange { .. })
        ));
        let compound = ShardKey::new(vec![KeyValue::Int(1), KeyValue::Int(2)]);
        assert!(matches!(
            t.clone_plus(&compound, &k(5), v(1, 0)),
            Err(ChunkError::KeyPatternMismatch(_))
        ));
    }

    #[test]
    fn test_from_chunks_rejects_overlap() {
        let err = ChunkRangeTable::from_chunks(
            pattern(),
            vec![(k(0), k(10)), (k(5), k(8))],
            v(1, 0),
        )
        .unwrap_err();
        assert!(matches!(err, ChunkError::RangeOverlap { .. }));
    }

    #[test]
    fn test_belongs_to_me_boundaries() {
        let t = table(&[(0, 10), (20, 30)], v(1, 0));

        assert!(t.belongs_to_me(&k(0)));
        assert!(t.belongs_to_me(&k(9)));
        assert!(!t.belongs_to_me(&k(10)));
        assert!(!t.belongs_to_me(&k(15)));
        assert!(t.belongs_to_me(&k(20)));
        assert!(!t.belongs_to_me(&k(30)));
        assert!(!t.belongs_to_me(&k(-1)));
        assert!(!t.belongs_to_me(&ShardKey::from(KeyValue::MinKey)));

        let empty = ChunkRangeTable::empty(pattern());
        assert!(!empty.belongs_to_me(&k(0)));
    }

    #[test]
    fn test_belongs_to_me_doc() {
        let t = ChunkRangeTable::from_chunks(
            pattern(),
            vec![(ShardKey::from(KeyValue::MinKey), k(0))],
            v(1, 0),
        )
        .unwrap();

        let mut doc = Document::new();
        doc.insert("y".into(), KeyValue::Int(100));
        // Missing shard key field projects to null, which sorts below ints.
        assert!(t.belongs_to_me_doc(&doc));

        doc.insert("x".into(), KeyValue::Int(3));
        assert!(!t.belongs_to_me_doc(&doc));
    }

    #[test]
    fn test_clone_split() {
        let t = table(&[(0, 100)], v(1, 0));

        let split = t
            .clone_split(&k(0), &k(100), &[k(25), k(50)], v(1, 1))
            .unwrap();
        let chunks: Vec<_> = split.chunks().map(|(a, b)| (a.clone(), b.clone())).collect();
        assert_eq!(
            chunks,
            vec![(k(0), k(25)), (k(25), k(50)), (k(50), k(100))]
        );
        assert_eq!(split.version(), v(1, 3));
        assert_eq!(ranges_of(&split), vec![(k(0), k(100))]);
    }

    #[test]
    fn test_clone_split_rejects_bad_keys() {
        let t = table(&[(0, 100)], v(1, 0));

        for keys in [vec![k(0)], vec![k(100)], vec![k(50), k(40)], vec![k(50), k(50)]] {
            assert!(matches!(
                t.clone_split(&k(0), &k(100), &keys, v(1, 1)),
                Err(ChunkError::InvalidSplitKey { .. })
            ));
        }
        assert!(matches!(
            t.clone_split(&k(0), &k(50), &[k(10)], v(1, 1)),
            Err(ChunkError::RangeMismatch { .. })
        ));
    }

    #[test]
    fn test_clone_split_version_overflow() {
        let t = table(&[(0, 100)], v(1, 0));

        let err = t
            .clone_split(&k(0), &k(100), &[k(50)], v(1, u32::MAX))
            .unwrap_err();
        assert_eq!(
            err,
            ChunkError::VersionOverflow {
                version: v(1, u32::MAX)
            }
        );

        // One split at MAX - 1 still fits.
        let split = t
            .clone_split(&k(0), &k(100), &[k(50)], v(1, u32::MAX - 1))
            .unwrap();
        assert_eq!(split.version(), v(1, u32::MAX));
    }

    #[test]
    fn test_next_chunk() {
        let t = table(&[(0, 10), (20, 30)], v(1, 0));

        assert_eq!(t.next_chunk(&k(-5)), Some((&k(0), &k(10))));
        assert_eq!(t.next_chunk(&k(5)), Some((&k(0), &k(10))));
        assert_eq!(t.next_chunk(&k(10)), Some((&k(20), &k(30))));
        assert_eq!(t.next_chunk(&k(30)), None);
    }

    #[test]
    fn test_load_from_metadata() {
        let source = InMemoryConfigMetadata::new();
        let shard_a = ShardId::from("a");
        let shard_b = ShardId::from("b");
        source.shard_collection("db.users", pattern());
        source.add_chunk(
            "db.users",
            ChunkMetadata::new(k(0), k(10), shard_a.clone(), v(1, 0)),
        );
        source.add_chunk(
            "db.users",
            ChunkMetadata::new(k(10), k(20), shard_b.clone(), v(1, 2)),
        );
        source.add_chunk(
            "db.users",
            ChunkMetadata::new(k(20), k(30), shard_a.clone(), v(1, 1)),
        );

        let t = ChunkRangeTable::load(&source, "db.users", &shard_a).unwrap();
        assert_eq!(t.num_chunks(), 2);
        assert_eq!(t.version(), v(1, 1));
        assert!(t.belongs_to_me(&k(25)));
        assert!(!t.belongs_to_me(&k(15)));

        let none = ChunkRangeTable::load(&source, "db.users", &ShardId::from("c")).unwrap();
        assert!(none.is_empty());
        assert_eq!(none.version(), ChunkVersion::ZERO);

        assert_eq!(
            ChunkRangeTable::load(&source, "db.missing", &shard_a).unwrap_err(),
            ChunkError::CollectionNotFound("db.missing".into())
        );

        source.drop_collection("db.users");
        assert_eq!(
            ChunkRangeTable::load(&source, "db.users", &shard_a).unwrap_err(),
            ChunkError::CollectionDropped("db.users".into())
        );
    }

    #[derive(Debug, Clone)]
    enum Op {
        Plus(i64, i64),
        Minus(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0i64..100, 1i64..20).prop_map(|(start, len)| Op::Plus(start, start + len)),
            any::<usize>().prop_map(Op::Minus),
        ]
    }

    proptest! {
        #[test]
        fn ranges_stay_maximal_and_disjoint(ops in proptest::collection::vec(op_strategy(), 1..40)) {
            let mut t = ChunkRangeTable::empty(pattern());
            let mut major = 0u32;
            for op in ops {
                major += 1;
                let next = match op {
                    Op::Plus(a, b) => t.clone_plus(&k(a), &k(b), v(major, 0)),
                    Op::Minus(i) => {
                        let chunks: Vec<_> = t.chunks().map(|(a, b)| (a.clone(), b.clone())).collect();
                        if chunks.is_empty() {
                            continue;
                        }
                        let (a, b) = &chunks[i % chunks.len()];
                        t.clone_minus(a, b, v(major, 0))
                    }
                };
                if let Ok(next) = next {
                    t = next;
                }
                assert_range_invariant(&t);
            }
        }

        #[test]
        fn keys_below_every_range_are_not_owned(
            starts in proptest::collection::btree_set(0i64..1000, 1..10),
            probe in -1000i64..0,
        ) {
            let chunks: Vec<_> = starts.iter().map(|&s| (k(s * 10), k(s * 10 + 5))).collect();
            let t = ChunkRangeTable::from_chunks(pattern(), chunks, v(1, 0)).unwrap();
            prop_assert!(!t.belongs_to_me(&k(probe)));
            prop_assert!(!t.belongs_to_me(&ShardKey::from(KeyValue::MinKey)));
        }

        #[test]
        fn membership_matches_linear_scan(
            starts in proptest::collection::btree_set(0i64..50, 0..10),
            probe in -10i64..600,
        ) {
            let chunks: Vec<_> = starts.iter().map(|&s| (s * 10, s * 10 + 10)).collect();
            let t = ChunkRangeTable::from_chunks(
                pattern(),
                chunks.iter().map(|&(a, b)| (k(a), k(b))),
                v(1, 0),
            )
            .unwrap();
            let expected = chunks.iter().any(|&(a, b)| a <= probe && probe < b);
            prop_assert_eq!(t.belongs_to_me(&k(probe)), expected);
        }
    }
}
