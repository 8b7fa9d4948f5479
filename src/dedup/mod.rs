//! Dedup module - Multi-strategy result deduplication
//!
//! Groups results of the same kind with a similarity strategy chosen by
//! that kind, keeps one representative per group and drops the rest from
//! the working set.
//!
//! - Content: keyword Jaccard (analysis, extraction, classification)
//! - Cross-field: blended keyword/text/field overlap (synthesis, summarization)
//! - Structural: key/type shape only (transformation, validation, enrichment)

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::swarm::analysis;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Kind of result being deduplicated; decides the similarity method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    Analysis,
    Extraction,
    Classification,
    Synthesis,
    Summarization,
    Transformation,
    Validation,
    Enrichment,
}

impl ResultKind {
    pub fn method(&self) -> SimilarityMethod {
        match self {
            ResultKind::Analysis | ResultKind::Extraction | ResultKind::Classification => {
                SimilarityMethod::Content
            }
            ResultKind::Synthesis | ResultKind::Summarization => SimilarityMethod::CrossField,
            ResultKind::Transformation | ResultKind::Validation | ResultKind::Enrichment => {
                SimilarityMethod::Structural
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMethod {
    Content,
    CrossField,
    Structural,
}

impl SimilarityMethod {
    /// Similarity a pair must exceed to be clustered.
    pub fn default_threshold(&self) -> f64 {
        match self {
            SimilarityMethod::Structural => 0.9,
            SimilarityMethod::Content => 0.8,
            SimilarityMethod::CrossField => 0.7,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SimilarityMethod::Content => "content",
            SimilarityMethod::CrossField => "cross_field",
            SimilarityMethod::Structural => "structural",
        }
    }
}

impl fmt::Display for SimilarityMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference a representative keeps to the group it absorbed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRef {
    pub group_id: String,
    pub method: SimilarityMethod,
    pub confidence: f64,
    pub absorbed: Vec<String>,
}

/// One result as seen by the deduplicator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupItem {
    pub id: String,
    pub kind: ResultKind,
    /// Structured payload; compared by shape or field values
    pub content: Value,
    /// Free text (summary, key points)
    pub text: String,
    pub keywords: Vec<String>,
    pub quality_score: f64,
    pub reliability: f64,
    pub latency_ms: u64,
    /// Set on representatives of clusters with more than one member
    pub duplicate_group: Option<GroupRef>,
}

impl DedupItem {
    pub fn new(id: impl Into<String>, kind: ResultKind, text: impl Into<String>) -> Self {
        let text = text.into();
        let keywords = analysis::extract_keywords(&text, 20);
        Self {
            id: id.into(),
            kind,
            content: Value::Null,
            text,
            keywords,
            quality_score: 0.0,
            reliability: 0.0,
            latency_ms: 0,
            duplicate_group: None,
        }
    }

    pub fn with_content(mut self, content: Value) -> Self {
        self.content = content;
        self
    }

    pub fn with_keywords(mut self, keywords: Vec<String>) -> Self {
        self.keywords = keywords;
        self
    }

    pub fn with_scores(mut self, quality_score: f64, reliability: f64, latency_ms: u64) -> Self {
        self.quality_score = quality_score;
        self.reliability = reliability;
        self.latency_ms = latency_ms;
        self
    }
}

/// A partition element: members, the representative kept, and how they matched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub id: String,
    pub kind: ResultKind,
    pub members: Vec<String>,
    pub representative: String,
    pub method: SimilarityMethod,
    /// Mean similarity of members to the cluster seed (1.0 for singletons)
    pub confidence: f64,
}

impl DuplicateGroup {
    pub fn is_singleton(&self) -> bool {
        self.members.len() == 1
    }
}

/// Result of a dedup pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupOutcome {
    /// Working set after removal: one item per group, in input order
    pub items: Vec<DedupItem>,
    pub groups: Vec<DuplicateGroup>,
    pub removed: Vec<String>,
}

impl DedupOutcome {
    pub fn report(&self) -> DedupReport {
        let clustered: Vec<&DuplicateGroup> =
            self.groups.iter().filter(|g| !g.is_singleton()).collect();
        let mut by_method: BTreeMap<String, usize> = BTreeMap::new();
        for group in &clustered {
            *by_method.entry(group.method.to_string()).or_insert(0) += 1;
        }
        DedupReport {
            scanned_items: self.items.len() + self.removed.len(),
            unique_items: self.items.len(),
            duplicate_groups: clustered.len(),
            total_duplicates: self.removed.len(),
            by_method,
            groups: clustered.into_iter().cloned().collect(),
            generated_at: Utc::now(),
        }
    }
}

/// Summary of a dedup pass for display and export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupReport {
    pub scanned_items: usize,
    pub unique_items: usize,
    pub duplicate_groups: usize,
    pub total_duplicates: usize,
    pub by_method: BTreeMap<String, usize>,
    pub groups: Vec<DuplicateGroup>,
    pub generated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Similarity strategies
// ---------------------------------------------------------------------------

/// Pairwise similarity plus representative ranking for one method.
pub trait SimilarityStrategy: Send + Sync {
    fn method(&self) -> SimilarityMethod;

    fn threshold(&self) -> f64 {
        self.method().default_threshold()
    }

    /// Similarity in [0, 1]
    fn similarity(&self, a: &DedupItem, b: &DedupItem) -> f64;

    /// Ordering where `Less` means `a` is the better representative.
    fn rank(&self, a: &DedupItem, b: &DedupItem) -> Ordering {
        b.quality_score
            .partial_cmp(&a.quality_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                b.reliability
                    .partial_cmp(&a.reliability)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| a.latency_ms.cmp(&b.latency_ms))
    }
}

fn keyword_set(item: &DedupItem) -> Vec<String> {
    if item.keywords.is_empty() {
        analysis::content_terms(&item.text)
    } else {
        item.keywords.iter().map(|k| k.to_lowercase()).collect()
    }
}

/// Keyword Jaccard
#[derive(Debug, Clone)]
pub struct ContentSimilarity {
    threshold: f64,
}

impl Default for ContentSimilarity {
    fn default() -> Self {
        Self {
            threshold: SimilarityMethod::Content.default_threshold(),
        }
    }
}

impl ContentSimilarity {
    pub fn with_threshold(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl SimilarityStrategy for ContentSimilarity {
    fn method(&self) -> SimilarityMethod {
        SimilarityMethod::Content
    }

    fn threshold(&self) -> f64 {
        self.threshold
    }

    fn similarity(&self, a: &DedupItem, b: &DedupItem) -> f64 {
        analysis::jaccard(&keyword_set(a), &keyword_set(b))
    }
}

/// Mean of keyword, text-term and field-value overlap over the facets
/// at least one side carries.
#[derive(Debug, Clone)]
pub struct CrossFieldSimilarity {
    threshold: f64,
}

impl Default for CrossFieldSimilarity {
    fn default() -> Self {
        Self {
            threshold: SimilarityMethod::CrossField.default_threshold(),
        }
    }
}

impl SimilarityStrategy for CrossFieldSimilarity {
    fn method(&self) -> SimilarityMethod {
        SimilarityMethod::CrossField
    }

    fn threshold(&self) -> f64 {
        self.threshold
    }

    fn similarity(&self, a: &DedupItem, b: &DedupItem) -> f64 {
        let facets = [
            (keyword_set(a), keyword_set(b)),
            (
                analysis::content_terms(&a.text),
                analysis::content_terms(&b.text),
            ),
            (field_values(&a.content), field_values(&b.content)),
        ];

        let scores: Vec<f64> = facets
            .iter()
            .filter(|(x, y)| !(x.is_empty() && y.is_empty()))
            .map(|(x, y)| analysis::jaccard(x, y))
            .collect();
        if scores.is_empty() {
            return 0.0;
        }
        scores.iter().sum::<f64>() / scores.len() as f64
    }
}

/// Jaccard over `path:type` leaves; values are ignored.
#[derive(Debug, Clone)]
pub struct StructuralSimilarity {
    threshold: f64,
}

impl Default for StructuralSimilarity {
    fn default() -> Self {
        Self {
            threshold: SimilarityMethod::Structural.default_threshold(),
        }
    }
}

impl SimilarityStrategy for StructuralSimilarity {
    fn method(&self) -> SimilarityMethod {
        SimilarityMethod::Structural
    }

    fn threshold(&self) -> f64 {
        self.threshold
    }

    fn similarity(&self, a: &DedupItem, b: &DedupItem) -> f64 {
        let sa: Vec<String> = shape(&a.content).into_iter().collect();
        let sb: Vec<String> = shape(&b.content).into_iter().collect();
        if sa.is_empty() && sb.is_empty() {
            return 0.0;
        }
        analysis::jaccard(&sa, &sb)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Key/type signature of a JSON value
pub fn shape(value: &Value) -> BTreeSet<String> {
    fn walk(value: &Value, path: &str, out: &mut BTreeSet<String>) {
        match value {
            Value::Object(map) if !map.is_empty() => {
                for (key, child) in map {
                    walk(child, &format!("{}.{}", path, key), out);
                }
            }
            Value::Array(items) if !items.is_empty() => {
                for child in items {
                    walk(child, &format!("{}[]", path), out);
                }
            }
            Value::Null if path.is_empty() => {}
            other => {
                out.insert(format!("{}:{}", path, type_name(other)));
            }
        }
    }

    let mut out = BTreeSet::new();
    walk(value, "", &mut out);
    out
}

/// `path=value` leaves of a JSON value, lowercased
fn field_values(value: &Value) -> Vec<String> {
    fn walk(value: &Value, path: &str, out: &mut Vec<String>) {
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    walk(child, &format!("{}.{}", path, key), out);
                }
            }
            Value::Array(items) => {
                for child in items {
                    walk(child, &format!("{}[]", path), out);
                }
            }
            Value::Null => {}
            Value::String(s) => out.push(format!("{}={}", path, s.to_lowercase())),
            other => out.push(format!("{}={}", path, other)),
        }
    }

    let mut out = Vec::new();
    walk(value, "", &mut out);
    out
}

// ---------------------------------------------------------------------------
// Deduplicator
// ---------------------------------------------------------------------------

pub struct Deduplicator {
    strategies: BTreeMap<SimilarityMethod, Box<dyn SimilarityStrategy>>,
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new()
            .with_strategy(Box::new(ContentSimilarity::default()))
            .with_strategy(Box::new(CrossFieldSimilarity::default()))
            .with_strategy(Box::new(StructuralSimilarity::default()))
    }
}

impl Deduplicator {
    /// Deduplicator with no strategies; kinds without one pass through as singletons.
    pub fn new() -> Self {
        Self {
            strategies: BTreeMap::new(),
        }
    }

    /// Add or replace the strategy for its method
    pub fn with_strategy(mut self, strategy: Box<dyn SimilarityStrategy>) -> Self {
        self.strategies.insert(strategy.method(), strategy);
        self
    }

    /// Deduplicate a mixed result set. Items are only compared with items
    /// of the same kind.
    pub fn deduplicate(&self, items: Vec<DedupItem>) -> DedupOutcome {
        let total = items.len();
        let mut by_kind: BTreeMap<ResultKind, Vec<usize>> = BTreeMap::new();
        for (i, item) in items.iter().enumerate() {
            by_kind.entry(item.kind).or_default().push(i);
        }

        // (input index, group) so the output keeps input order
        let mut grouped: Vec<(usize, DuplicateGroup)> = Vec::new();
        for (kind, indices) in &by_kind {
            let subset: Vec<&DedupItem> = indices.iter().map(|&i| &items[i]).collect();
            for (rep_local, group) in self.group_kind(*kind, &subset) {
                grouped.push((indices[rep_local], group));
            }
        }
        grouped.sort_by_key(|(idx, _)| *idx);

        let mut items: Vec<Option<DedupItem>> = items.into_iter().map(Some).collect();
        let mut kept = Vec::with_capacity(grouped.len());
        let mut removed = Vec::new();
        let mut groups = Vec::with_capacity(grouped.len());

        for (rep_idx, group) in grouped {
            if let Some(mut rep) = items[rep_idx].take() {
                if !group.is_singleton() {
                    rep.duplicate_group = Some(GroupRef {
                        group_id: group.id.clone(),
                        method: group.method,
                        confidence: group.confidence,
                        absorbed: group
                            .members
                            .iter()
                            .filter(|m| **m != group.representative)
                            .cloned()
                            .collect(),
                    });
                }
                kept.push(rep);
            }
            groups.push(group);
        }
        for item in items.into_iter().flatten() {
            removed.push(item.id);
        }

        if !removed.is_empty() {
            info!(
                "Dedup: {} results -> {} unique ({} removed)",
                total,
                kept.len(),
                removed.len()
            );
        }

        DedupOutcome {
            items: kept,
            groups,
            removed,
        }
    }

    /// Cluster items of one kind. Returns (representative index, group) pairs.
    pub fn group_kind(&self, kind: ResultKind, items: &[&DedupItem]) -> Vec<(usize, DuplicateGroup)> {
        let method = kind.method();
        let Some(strategy) = self.strategies.get(&method) else {
            return items
                .iter()
                .enumerate()
                .map(|(i, item)| (i, singleton(kind, method, item)))
                .collect();
        };

        let matrix = similarity_matrix(strategy.as_ref(), items);
        let threshold = strategy.threshold();
        let mut assigned = vec![false; items.len()];
        let mut out = Vec::new();

        for seed in 0..items.len() {
            if assigned[seed] {
                continue;
            }
            assigned[seed] = true;
            let mut members = vec![seed];
            let mut sims = Vec::new();
            for other in (seed + 1)..items.len() {
                if assigned[other] {
                    continue;
                }
                let sim = matrix[seed][other - seed - 1];
                if sim > threshold {
                    assigned[other] = true;
                    members.push(other);
                    sims.push(sim);
                }
            }

            if members.len() == 1 {
                out.push((seed, singleton(kind, method, items[seed])));
                continue;
            }

            // Members are in input order, so min_by keeps the earliest on full ties
            let rep = members
                .iter()
                .copied()
                .min_by(|&a, &b| strategy.rank(items[a], items[b]))
                .unwrap_or(seed);
            let confidence = sims.iter().sum::<f64>() / sims.len() as f64;

            debug!(
                "Dedup group of {} ({} similarity {:.2}), keeping {}",
                members.len(),
                method,
                confidence,
                items[rep].id
            );

            out.push((
                rep,
                DuplicateGroup {
                    id: format!("dup:{}", items[rep].id),
                    kind,
                    members: members.iter().map(|&m| items[m].id.clone()).collect(),
                    representative: items[rep].id.clone(),
                    method,
                    confidence,
                },
            ));
        }

        out
    }
}

fn singleton(kind: ResultKind, method: SimilarityMethod, item: &DedupItem) -> DuplicateGroup {
    DuplicateGroup {
        id: format!("dup:{}", item.id),
        kind,
        members: vec![item.id.clone()],
        representative: item.id.clone(),
        method,
        confidence: 1.0,
    }
}

/// Upper-triangle similarity rows: `row[i][j - i - 1]` is sim(i, j).
fn similarity_matrix(strategy: &dyn SimilarityStrategy, items: &[&DedupItem]) -> Vec<Vec<f64>> {
    (0..items.len())
        .into_par_iter()
        .map(|i| {
            ((i + 1)..items.len())
                .map(|j| strategy.similarity(items[i], items[j]))
                .collect()
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Report formatting
// ---------------------------------------------------------------------------

impl DedupReport {
    /// Format as human-readable summary.
    pub fn to_human_string(&self) -> String {
        let mut out = String::new();

        out.push_str(&format!(
            "\n  Docswarm Dedup Report\n  {}\n\n",
            "=".repeat(40)
        ));
        out.push_str(&format!("  Scanned:          {} results\n", self.scanned_items));
        out.push_str(&format!("  Unique:           {} results\n", self.unique_items));
        out.push_str(&format!("  Duplicate groups: {}\n", self.duplicate_groups));
        out.push_str(&format!("  Total duplicates: {}\n", self.total_duplicates));
        for (method, count) in &self.by_method {
            out.push_str(&format!("  {:<17} {} groups\n", format!("{}:", method), count));
        }
        out.push_str(&format!(
            "  Generated:        {}\n\n",
            self.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
        ));

        for (i, group) in self.groups.iter().enumerate() {
            out.push_str(&format!(
                "  Group #{} [{}] ({:.0}% similar, {} members)\n",
                i + 1,
                group.method.as_str().to_uppercase(),
                group.confidence * 100.0,
                group.members.len()
            ));
            out.push_str(&format!("    KEEP  {}\n", group.representative));
            for member in group.members.iter().filter(|m| **m != group.representative) {
                out.push_str(&format!("    DROP  {}\n", member));
            }
            out.push('\n');
        }

        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn shared_keywords(extra: &str) -> Vec<String> {
        let mut kw: Vec<String> = (0..11).map(|i| format!("term{}", i)).collect();
        kw.push(extra.to_string());
        kw
    }

    fn item(id: &str, kind: ResultKind, keywords: Vec<String>, quality: f64) -> DedupItem {
        DedupItem::new(id, kind, "")
            .with_keywords(keywords)
            .with_scores(quality, 0.5, 100)
    }

    #[test]
    fn test_near_identical_results_cluster_with_best_representative() {
        // 11 shared + 1 unique each: pairwise Jaccard 11/13 ~ 0.85
        let items = vec![
            item("r1", ResultKind::Analysis, shared_keywords("alpha"), 0.6),
            item("r2", ResultKind::Analysis, shared_keywords("beta"), 0.9),
            item("r3", ResultKind::Analysis, shared_keywords("gamma"), 0.7),
        ];
        let sim = ContentSimilarity::default().similarity(&items[0], &items[1]);
        assert!((sim - 11.0 / 13.0).abs() < 1e-9);

        let outcome = Deduplicator::default().deduplicate(items);
        assert_eq!(outcome.groups.len(), 1);
        let group = &outcome.groups[0];
        assert_eq!(group.members, vec!["r1", "r2", "r3"]);
        assert_eq!(group.representative, "r2");
        assert_eq!(group.method, SimilarityMethod::Content);

        assert_eq!(outcome.items.len(), 1);
        assert_eq!(outcome.items[0].id, "r2");
        let absorbed = outcome.items[0].duplicate_group.as_ref().unwrap();
        assert_eq!(absorbed.absorbed, vec!["r1", "r3"]);
        assert_eq!(outcome.removed, vec!["r1", "r3"]);
    }

    #[test]
    fn test_distinct_results_stay_singletons() {
        let items = vec![
            item("a", ResultKind::Extraction, vec!["rust".into(), "tokio".into()], 0.5),
            item("b", ResultKind::Extraction, vec!["python".into(), "django".into()], 0.5),
        ];
        let outcome = Deduplicator::default().deduplicate(items);
        assert_eq!(outcome.groups.len(), 2);
        assert!(outcome.groups.iter().all(|g| g.is_singleton()));
        assert!(outcome.items.iter().all(|i| i.duplicate_group.is_none()));
        assert!(outcome.removed.is_empty());
    }

    #[test]
    fn test_representative_tiebreaks() {
        let kw = vec!["same".to_string(), "words".to_string()];
        let a = item("a", ResultKind::Analysis, kw.clone(), 0.8).with_scores(0.8, 0.4, 10);
        let b = item("b", ResultKind::Analysis, kw.clone(), 0.8).with_scores(0.8, 0.9, 50);
        let c = item("c", ResultKind::Analysis, kw.clone(), 0.8).with_scores(0.8, 0.9, 20);
        let outcome = Deduplicator::default().deduplicate(vec![a, b, c]);
        assert_eq!(outcome.groups[0].representative, "c");

        let d = item("d", ResultKind::Analysis, kw.clone(), 0.8);
        let e = item("e", ResultKind::Analysis, kw, 0.8);
        let outcome = Deduplicator::default().deduplicate(vec![d, e]);
        assert_eq!(outcome.groups[0].representative, "d");
    }

    #[test]
    fn test_kinds_are_never_mixed() {
        let kw = vec!["identical".to_string(), "keywords".to_string()];
        let items = vec![
            item("a", ResultKind::Analysis, kw.clone(), 0.5),
            item("b", ResultKind::Classification, kw, 0.5),
        ];
        let outcome = Deduplicator::default().deduplicate(items);
        assert_eq!(outcome.items.len(), 2);
    }

    #[test]
    fn test_structural_ignores_values() {
        let a = DedupItem::new("a", ResultKind::Transformation, "")
            .with_content(json!({"name": "Ada", "age": 36, "tags": ["x"]}));
        let b = DedupItem::new("b", ResultKind::Transformation, "")
            .with_content(json!({"name": "Grace", "age": 45, "tags": ["y", "z"]}));
        let c = DedupItem::new("c", ResultKind::Transformation, "")
            .with_content(json!({"name": "Linus", "age": "unknown"}));

        let strategy = StructuralSimilarity::default();
        assert_eq!(strategy.similarity(&a, &b), 1.0);
        assert!(strategy.similarity(&a, &c) < 0.9);

        let outcome = Deduplicator::default().deduplicate(vec![a, b, c]);
        assert_eq!(outcome.items.len(), 2);
        assert_eq!(outcome.groups[0].method, SimilarityMethod::Structural);
    }

    #[test]
    fn test_shape_signature() {
        let sig = shape(&json!({"a": {"b": 1}, "c": [true]}));
        assert!(sig.contains(".a.b:number"));
        assert!(sig.contains(".c[]:bool"));
        assert!(shape(&Value::Null).is_empty());
    }

    #[test]
    fn test_cross_field_is_looser() {
        let a = DedupItem::new(
            "a",
            ResultKind::Synthesis,
            "Revenue grew in the northern region during spring",
        )
        .with_content(json!({"region": "north", "trend": "up"}));
        let b = DedupItem::new(
            "b",
            ResultKind::Synthesis,
            "Revenue grew in the northern region during summer",
        )
        .with_content(json!({"region": "north", "trend": "up"}));

        let sim = CrossFieldSimilarity::default().similarity(&a, &b);
        assert!(sim > 0.7 && sim < 1.0, "sim = {}", sim);
        let outcome = Deduplicator::default().deduplicate(vec![a, b]);
        assert_eq!(outcome.items.len(), 1);
    }

    #[test]
    fn test_missing_strategy_passes_through() {
        let kw = vec!["x".to_string()];
        let dedup = Deduplicator::new().with_strategy(Box::new(StructuralSimilarity::default()));
        let outcome = dedup.deduplicate(vec![
            item("a", ResultKind::Analysis, kw.clone(), 0.1),
            item("b", ResultKind::Analysis, kw, 0.1),
        ]);
        assert_eq!(outcome.items.len(), 2);
    }

    #[test]
    fn test_custom_threshold() {
        let items = vec![
            item("a", ResultKind::Analysis, vec!["x".into(), "y".into()], 0.1),
            item("b", ResultKind::Analysis, vec!["x".into(), "z".into()], 0.2),
        ];
        let loose = Deduplicator::new().with_strategy(Box::new(ContentSimilarity::with_threshold(0.3)));
        assert_eq!(loose.deduplicate(items.clone()).items.len(), 1);
        assert_eq!(Deduplicator::default().deduplicate(items).items.len(), 2);
    }

    #[test]
    fn test_report_human_string() {
        let items = vec![
            item("r1", ResultKind::Analysis, shared_keywords("alpha"), 0.6),
            item("r2", ResultKind::Analysis, shared_keywords("beta"), 0.9),
            item("solo", ResultKind::Analysis, vec!["other".into()], 0.9),
        ];
        let report = Deduplicator::default().deduplicate(items).report();
        assert_eq!(report.scanned_items, 3);
        assert_eq!(report.unique_items, 2);
        assert_eq!(report.duplicate_groups, 1);
        assert_eq!(report.total_duplicates, 1);

        let text = report.to_human_string();
        assert!(text.contains("Duplicate groups: 1"));
        assert!(text.contains("KEEP  r2"));
        assert!(text.contains("DROP  r1"));
    }

    fn arb_item() -> impl Strategy<Value = (u8, Vec<u8>, u8)> {
        (0u8..3, prop::collection::vec(0u8..6, 0..5), 0u8..10)
    }

    proptest! {
        #[test]
        fn prop_groups_partition_input(specs in prop::collection::vec(arb_item(), 0..24)) {
            let kinds = [ResultKind::Analysis, ResultKind::Synthesis, ResultKind::Validation];
            let items: Vec<DedupItem> = specs
                .iter()
                .enumerate()
                .map(|(i, (kind, words, q))| {
                    let keywords: Vec<String> = words.iter().map(|w| format!("w{}", w)).collect();
                    DedupItem::new(format!("i{}", i), kinds[*kind as usize], keywords.join(" "))
                        .with_keywords(keywords.clone())
                        .with_content(json!({ "k": keywords }))
                        .with_scores(*q as f64 / 10.0, 0.5, 1)
                })
                .collect();
            let ids: BTreeSet<String> = items.iter().map(|i| i.id.clone()).collect();

            let outcome = Deduplicator::default().deduplicate(items);

            let mut seen = BTreeSet::new();
            for group in &outcome.groups {
                prop_assert!(group.members.contains(&group.representative));
                for member in &group.members {
                    prop_assert!(seen.insert(member.clone()), "{} in two groups", member);
                }
            }
            prop_assert_eq!(&seen, &ids);
            prop_assert_eq!(outcome.items.len(), outcome.groups.len());
            prop_assert_eq!(outcome.items.len() + outcome.removed.len(), ids.len());
        }
    }
}
