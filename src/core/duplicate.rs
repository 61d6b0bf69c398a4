// Duplicate grouping:
// - hash groups: exact fingerprint equality
// - feature groups: exact feature-vector equality, or opt-in cosine clustering
// Both are computed independently from the same stream of process results.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use crate::core::features::{FeatureKey, FeatureVector};
use crate::core::hash::Fingerprint;
use crate::core::image::ProcessResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateType {
    Hash,    // Same average hash
    Feature, // Same (or close enough) feature vector
}

/// How feature vectors are matched when building feature groups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FeatureMatching {
    /// Group only vectors that are equal component by component.
    #[default]
    Exact,
    /// Single-linkage clustering: two images are linked when the cosine
    /// similarity of their vectors is at least `min_similarity`.
    Cosine { min_similarity: f32 },
}

/// Two or more distinct paths that share a fingerprint or feature vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub group_type: DuplicateType,
    /// The shared fingerprint, for hash groups.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,
    pub paths: Vec<PathBuf>,
}

impl DuplicateGroup {
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn contains(&self, path: &std::path::Path) -> bool {
        self.paths.iter().any(|p| p == path)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportStats {
    pub images: usize,
    pub hash_failures: usize,
    pub feature_failures: usize,
}

/// Everything one engine run produces. Empty groups lists mean no
/// duplicates were found, which is not an error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DuplicateReport {
    pub hash_groups: Vec<DuplicateGroup>,
    pub feature_groups: Vec<DuplicateGroup>,
    pub stats: ReportStats,
}

impl DuplicateReport {
    pub fn is_empty(&self) -> bool {
        self.hash_groups.is_empty() && self.feature_groups.is_empty()
    }
}

/// Buckets process results by fingerprint and by feature vector.
///
/// Runs on a single thread after the pool has been drained. Buckets and the
/// paths inside them keep first-seen order. A path inserted more than once is
/// only counted the first time, so a group never lists the same file twice.
pub struct DuplicateAggregator {
    matching: FeatureMatching,
    hash_index: HashMap<Fingerprint, usize>,
    hash_buckets: Vec<(Fingerprint, Vec<PathBuf>)>,
    feature_index: HashMap<FeatureKey, usize>,
    feature_buckets: Vec<(FeatureVector, Vec<PathBuf>)>,
    hashed_paths: HashSet<PathBuf>,
    featured_paths: HashSet<PathBuf>,
    stats: ReportStats,
}

impl DuplicateAggregator {
    pub fn new(matching: FeatureMatching) -> Self {
        Self {
            matching,
            hash_index: HashMap::new(),
            hash_buckets: Vec::new(),
            feature_index: HashMap::new(),
            feature_buckets: Vec::new(),
            hashed_paths: HashSet::new(),
            featured_paths: HashSet::new(),
            stats: ReportStats::default(),
        }
    }

    pub fn insert(&mut self, result: ProcessResult) {
        let ProcessResult {
            path,
            fingerprint,
            features,
        } = result;
        self.stats.images += 1;

        match fingerprint {
            Some(fingerprint) => {
                if self.hashed_paths.insert(path.clone()) {
                    let idx = *self.hash_index.entry(fingerprint).or_insert_with(|| {
                        self.hash_buckets.push((fingerprint, Vec::new()));
                        self.hash_buckets.len() - 1
                    });
                    self.hash_buckets[idx].1.push(path.clone());
                } else {
                    log::debug!("Ignoring repeated path {}", path.display());
                }
            }
            None => self.stats.hash_failures += 1,
        }

        match features {
            Some(features) => {
                if self.featured_paths.insert(path.clone()) {
                    let key = features.key();
                    match self.feature_index.get(&key) {
                        Some(&idx) => self.feature_buckets[idx].1.push(path),
                        None => {
                            self.feature_index.insert(key, self.feature_buckets.len());
                            self.feature_buckets.push((features, vec![path]));
                        }
                    }
                }
            }
            None => self.stats.feature_failures += 1,
        }
    }

    pub fn finish(self) -> DuplicateReport {
        let hash_groups = self
            .hash_buckets
            .into_iter()
            .filter(|(_, paths)| paths.len() > 1)
            .map(|(fingerprint, paths)| DuplicateGroup {
                group_type: DuplicateType::Hash,
                fingerprint: Some(fingerprint),
                paths,
            })
            .collect();

        let feature_buckets = match self.matching {
            FeatureMatching::Exact => self
                .feature_buckets
                .into_iter()
                .map(|(_, paths)| paths)
                .collect(),
            FeatureMatching::Cosine { min_similarity } => {
                cluster_by_cosine(self.feature_buckets, min_similarity)
            }
        };
        let feature_groups = feature_buckets
            .into_iter()
            .filter(|paths| paths.len() > 1)
            .map(|paths| DuplicateGroup {
                group_type: DuplicateType::Feature,
                fingerprint: None,
                paths,
            })
            .collect();

        DuplicateReport {
            hash_groups,
            feature_groups,
            stats: self.stats,
        }
    }
}

impl Extend<ProcessResult> for DuplicateAggregator {
    fn extend<T: IntoIterator<Item = ProcessResult>>(&mut self, iter: T) {
        for result in iter {
            self.insert(result);
        }
    }
}

/// Group `results` by fingerprint and by feature vector.
pub fn aggregate(
    results: impl IntoIterator<Item = ProcessResult>,
    matching: FeatureMatching,
) -> DuplicateReport {
    let mut aggregator = DuplicateAggregator::new(matching);
    aggregator.extend(results);
    aggregator.finish()
}

/// Merge exact-equality buckets whose vectors are within `min_similarity`
/// of each other, transitively. Output keeps first-seen order of buckets.
fn cluster_by_cosine(
    buckets: Vec<(FeatureVector, Vec<PathBuf>)>,
    min_similarity: f32,
) -> Vec<Vec<PathBuf>> {
    let mut sets = DisjointSet::new(buckets.len());
    for i in 0..buckets.len() {
        for j in (i + 1)..buckets.len() {
            let similar = buckets[i]
                .0
                .cosine_similarity(&buckets[j].0)
                .is_some_and(|s| s >= min_similarity);
            if similar {
                sets.union(i, j);
            }
        }
    }

    let mut root_slot: HashMap<usize, usize> = HashMap::new();
    let mut clusters: Vec<Vec<PathBuf>> = Vec::new();
    for (i, (_, paths)) in buckets.into_iter().enumerate() {
        let root = sets.find(i);
        let slot = *root_slot.entry(root).or_insert_with(|| {
            clusters.push(Vec::new());
            clusters.len() - 1
        });
        clusters[slot].extend(paths);
    }
    clusters
}

struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Lower index wins so roots stay stable under first-seen order
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }
}
