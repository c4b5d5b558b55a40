//! Secondary access paths: full-text search, semantic similarity and field
//! indexes, maintained as node-local materialized views.
//!
//! The store drives these through the [`IndexObserver`] interface: after a
//! committed mutation is applied, every registered observer is invoked
//! synchronously, in commit order, with the key and its new value (or a
//! tombstone for deletions). Because every node applies the same log in the
//! same order, the views converge everywhere without being replicated
//! themselves; on startup they are rebuilt from the recovered state machine.
//!
//! The one piece of index state with no source in the log is the set of
//! fields registered through `create_index`. That set is persisted in a small
//! `indexes.state` file (replaced atomically, like the hard state) and
//! reloaded by [`SearchIndex::open`], so field indexes survive a restart the
//! same way every other acknowledged operation does.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;

use crate::Value;

/// A callback invoked for every applied mutation, in commit order.
///
/// Implementations run inside the apply path of the event loop: they must be
/// synchronous and quick, and must never suspend.
pub trait IndexObserver: Send + Sync + 'static {
    /// `value` is the new value of `key`, or `None` when the key was deleted.
    /// `index` is the log index of the entry which produced the mutation.
    fn on_apply(&self, key: &str, value: Option<&Value>, index: u64);
}

/// A scored search result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub key: String,
    pub score: f64,
}

/// BM25 parameter: term-frequency saturation.
const BM25_K1: f64 = 1.2;
/// BM25 parameter: document-length normalization.
const BM25_B: f64 = 0.75;

#[derive(Default)]
struct IndexInner {
    /// Per-key token frequencies for string values.
    docs: HashMap<String, Doc>,
    /// Inverted index: term -> key -> term frequency.
    postings: HashMap<String, HashMap<String, u32>>,
    /// Total token count across all documents, for the average length.
    total_len: u64,
    /// Per-key map values, kept for backfilling newly created field indexes.
    maps: HashMap<String, BTreeMap<String, Value>>,
    /// field -> encoded field value -> keys.
    field_indexes: HashMap<String, HashMap<String, BTreeSet<String>>>,
}

struct Doc {
    len: u32,
    tf: HashMap<String, u32>,
}

/// The node-local search & secondary index, fed from the apply stream.
pub struct SearchIndex {
    inner: Mutex<IndexInner>,
    /// Where the registered field set is persisted; `None` for an ephemeral
    /// index (tests).
    path: Option<PathBuf>,
}

impl Default for SearchIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl SearchIndex {
    /// An ephemeral index: nothing is persisted.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(IndexInner::default()),
            path: None,
        }
    }

    /// Open an index whose registered field set is persisted at `path`,
    /// reloading any fields recorded by earlier `create_index` calls. The
    /// views themselves refill from the apply stream (or `rebuild`).
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut inner = IndexInner::default();
        match std::fs::read(&path) {
            Ok(raw) => {
                let fields: Vec<String> = serde_json::from_slice(&raw)
                    .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
                for field in fields {
                    inner.field_indexes.insert(field, HashMap::new());
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        Ok(Self {
            inner: Mutex::new(inner),
            path: Some(path),
        })
    }

    /// Rebuild the views from a snapshot of the applied map. Used at startup
    /// after WAL recovery; repopulates the text index and, for every
    /// registered field, the field indexes.
    pub fn rebuild(&self, data: &BTreeMap<String, Value>) {
        for (key, value) in data {
            self.on_apply(key, Some(value), 0);
        }
    }

    /// Full-text search over string values, ranked by BM25.
    pub fn search(&self, query: &str, top_k: usize) -> Vec<SearchHit> {
        let inner = self.inner.lock().expect("index lock poisoned");
        let doc_count = inner.docs.len();
        if doc_count == 0 {
            return Vec::new();
        }
        let avg_len = inner.total_len as f64 / doc_count as f64;

        let mut scores: HashMap<&str, f64> = HashMap::new();
        for term in tokenize(query) {
            let Some(keys) = inner.postings.get(&term) else { continue };
            let df = keys.len() as f64;
            let idf = (1.0 + (doc_count as f64 - df + 0.5) / (df + 0.5)).ln();
            for (key, tf) in keys {
                let doc_len = inner.docs.get(key).map(|doc| doc.len).unwrap_or(0) as f64;
                let tf = *tf as f64;
                let norm = tf * (BM25_K1 + 1.0) / (tf + BM25_K1 * (1.0 - BM25_B + BM25_B * doc_len / avg_len));
                *scores.entry(key.as_str()).or_default() += idf * norm;
            }
        }
        top_hits(scores, top_k)
    }

    /// Semantic similarity search: cosine distance between TF-IDF vectors of
    /// the query and each document.
    pub fn semantic_search(&self, query: &str, top_k: usize) -> Vec<SearchHit> {
        let inner = self.inner.lock().expect("index lock poisoned");
        let doc_count = inner.docs.len();
        if doc_count == 0 {
            return Vec::new();
        }

        // The query's TF-IDF vector.
        let mut query_tf: HashMap<String, u32> = HashMap::new();
        for term in tokenize(query) {
            *query_tf.entry(term).or_default() += 1;
        }
        let idf = |term: &str| {
            let df = inner.postings.get(term).map(|keys| keys.len()).unwrap_or(0) as f64;
            (doc_count as f64 / (1.0 + df)).ln() + 1.0
        };
        let query_vec: HashMap<&str, f64> =
            query_tf.iter().map(|(term, tf)| (term.as_str(), *tf as f64 * idf(term))).collect();
        let query_norm = query_vec.values().map(|w| w * w).sum::<f64>().sqrt();
        if query_norm == 0.0 {
            return Vec::new();
        }

        let mut scores: HashMap<&str, f64> = HashMap::new();
        for (key, doc) in &inner.docs {
            let mut dot = 0.0;
            let mut doc_norm_sq = 0.0;
            for (term, tf) in &doc.tf {
                let w = *tf as f64 * idf(term);
                doc_norm_sq += w * w;
                if let Some(qw) = query_vec.get(term.as_str()) {
                    dot += w * qw;
                }
            }
            if dot > 0.0 {
                scores.insert(key.as_str(), dot / (doc_norm_sq.sqrt() * query_norm));
            }
        }
        top_hits(scores, top_k)
    }

    /// Create a secondary index over `field` of map values, backfilled from
    /// the current state. Idempotent. The registration is recorded durably
    /// before it takes effect, so it survives a restart.
    pub fn create_index(&self, field: &str) -> std::io::Result<()> {
        let mut inner = self.inner.lock().expect("index lock poisoned");
        if inner.field_indexes.contains_key(field) {
            return Ok(());
        }
        if let Some(path) = &self.path {
            let mut fields: Vec<String> = inner.field_indexes.keys().cloned().collect();
            fields.push(field.to_string());
            fields.sort();
            persist_fields(path, &fields)?;
        }
        let mut by_value: HashMap<String, BTreeSet<String>> = HashMap::new();
        for (key, map) in &inner.maps {
            if let Some(value) = map.get(field) {
                by_value.entry(encode_field_value(value)).or_default().insert(key.clone());
            }
        }
        inner.field_indexes.insert(field.to_string(), by_value);
        Ok(())
    }

    /// Look up the keys whose map value holds `value` under `field`.
    /// Returns `None` if no index exists for `field`.
    pub fn query_index(&self, field: &str, value: &Value) -> Option<Vec<String>> {
        let inner = self.inner.lock().expect("index lock poisoned");
        let by_value = inner.field_indexes.get(field)?;
        Some(
            by_value
                .get(&encode_field_value(value))
                .map(|keys| keys.iter().cloned().collect())
                .unwrap_or_default(),
        )
    }

    fn remove_key(inner: &mut IndexInner, key: &str) {
        if let Some(doc) = inner.docs.remove(key) {
            inner.total_len -= doc.len as u64;
            for term in doc.tf.keys() {
                if let Some(keys) = inner.postings.get_mut(term) {
                    keys.remove(key);
                    if keys.is_empty() {
                        inner.postings.remove(term);
                    }
                }
            }
        }
        if let Some(map) = inner.maps.remove(key) {
            for (field, by_value) in inner.field_indexes.iter_mut() {
                if let Some(value) = map.get(field) {
                    if let Some(keys) = by_value.get_mut(&encode_field_value(value)) {
                        keys.remove(key);
                    }
                }
            }
        }
    }
}

impl IndexObserver for SearchIndex {
    fn on_apply(&self, key: &str, value: Option<&Value>, _index: u64) {
        let mut inner = self.inner.lock().expect("index lock poisoned");
        Self::remove_key(&mut inner, key);
        match value {
            Some(Value::String(text)) => {
                let mut tf: HashMap<String, u32> = HashMap::new();
                let mut len = 0u32;
                for term in tokenize(text) {
                    *tf.entry(term).or_default() += 1;
                    len += 1;
                }
                for (term, count) in &tf {
                    inner.postings.entry(term.clone()).or_default().insert(key.to_string(), *count);
                }
                inner.total_len += len as u64;
                inner.docs.insert(key.to_string(), Doc { len, tf });
            }
            Some(Value::Map(map)) => {
                for (field, by_value) in inner.field_indexes.iter_mut() {
                    if let Some(value) = map.get(field) {
                        by_value.entry(encode_field_value(value)).or_default().insert(key.to_string());
                    }
                }
                inner.maps.insert(key.to_string(), map.clone());
            }
            // Integers are not text and carry no fields.
            Some(Value::Integer(_)) | None => {}
        }
    }
}

/// Lowercased alphanumeric tokens.
fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

/// Field values are matched by their canonical JSON encoding.
fn encode_field_value(value: &Value) -> String {
    serde_json::to_string(value).expect("value encoding cannot fail")
}

/// Write the registered field list to disk, via a fsynced temp file renamed
/// over the live one.
fn persist_fields(path: &Path, fields: &[String]) -> std::io::Result<()> {
    let tmp = path.with_extension("state.tmp");
    let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(&tmp)?;
    file.write_all(&serde_json::to_vec(fields)?)?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&tmp, path)
}

fn top_hits(scores: HashMap<&str, f64>, top_k: usize) -> Vec<SearchHit> {
    let mut hits: Vec<SearchHit> = scores
        .into_iter()
        .map(|(key, score)| SearchHit {
            key: key.to_string(),
            score,
        })
        .collect();
    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal).then(a.key.cmp(&b.key)));
    hits.truncate(top_k);
    hits
}
