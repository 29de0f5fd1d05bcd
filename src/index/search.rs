//! Catalog search: BM25 scoring plus optional semantic fusion.
//!
//! BM25 parameters: k1=1.2 (term frequency saturation), b=0.75 (length
//! normalization). Field weights are expressed by token repetition: name
//! tokens appear 3x, tag and namespace tokens 2x, description tokens 1x.
//! Hybrid ranking fuses the BM25 list with a pluggable `Searcher` via
//! weighted Reciprocal Rank Fusion (k=60).

use std::collections::HashMap;

use crate::model::Tool;

const K1: f64 = 1.2;
const B: f64 = 0.75;
const RRF_K: f64 = 60.0;

const NAME_WEIGHT: usize = 3;
const TAG_WEIGHT: usize = 2;
const NAMESPACE_WEIGHT: usize = 2;

/// An optional semantic retrieval collaborator. Implementations return
/// `(tool_id, similarity)` pairs ranked best-first.
pub trait Searcher: Send + Sync {
    fn name(&self) -> &str;
    fn search(&self, query: &str, limit: usize) -> anyhow::Result<Vec<(String, f64)>>;
}

/// A tool flattened into a scored search document.
#[derive(Debug, Clone)]
pub struct SearchDoc {
    pub tool_id: String,
    pub namespace: String,
    pub name: String,
    tokens: Vec<String>,
}

/// A ranked search hit. `score` is BM25 or fused-RRF depending on the path.
#[derive(Debug, Clone)]
pub struct ScoredHit {
    pub tool_id: String,
    pub namespace: String,
    pub name: String,
    pub score: f64,
}

pub fn build_doc(tool: &Tool) -> SearchDoc {
    let mut tokens = Vec::new();
    let name_tokens = tokenize(&tool.name);
    for _ in 0..NAME_WEIGHT {
        tokens.extend(name_tokens.iter().cloned());
    }
    let ns_tokens = tokenize(&tool.namespace);
    for _ in 0..NAMESPACE_WEIGHT {
        tokens.extend(ns_tokens.iter().cloned());
    }
    for tag in &tool.tags {
        let tag_tokens = tokenize(tag);
        for _ in 0..TAG_WEIGHT {
            tokens.extend(tag_tokens.iter().cloned());
        }
    }
    tokens.extend(tokenize(&tool.description));
    SearchDoc {
        tool_id: tool.id.clone(),
        namespace: tool.namespace.clone(),
        name: tool.name.clone(),
        tokens,
    }
}

/// Score a corpus against a query. Returns hits with score > 0, sorted by
/// `(score desc, namespace asc, name asc, tool_id asc)` — the trailing id key
/// guarantees a deterministic order for pagination.
pub fn bm25_rank(docs: &[SearchDoc], query: &str) -> Vec<ScoredHit> {
    let query_terms = tokenize(query);
    if query_terms.is_empty() || docs.is_empty() {
        return Vec::new();
    }

    let n = docs.len() as f64;
    let avgdl: f64 = docs.iter().map(|d| d.tokens.len() as f64).sum::<f64>() / n;

    // Document frequency per query term
    let mut df: HashMap<&str, f64> = HashMap::new();
    for term in &query_terms {
        let count = docs
            .iter()
            .filter(|d| d.tokens.iter().any(|t| token_matches(t, term)))
            .count();
        df.insert(term.as_str(), count as f64);
    }

    let mut scored: Vec<ScoredHit> = docs
        .iter()
        .filter_map(|doc| {
            let dl = doc.tokens.len() as f64;
            let mut score = 0.0f64;
            for term in &query_terms {
                let term_freq =
                    doc.tokens.iter().filter(|t| token_matches(t, term)).count() as f64;
                if term_freq == 0.0 {
                    continue;
                }
                let doc_freq = df.get(term.as_str()).copied().unwrap_or(0.0);
                let idf = ((n - doc_freq + 0.5) / (doc_freq + 0.5) + 1.0).ln();
                let tf_norm =
                    (term_freq * (K1 + 1.0)) / (term_freq + K1 * (1.0 - B + B * dl / avgdl));
                score += idf * tf_norm;
            }
            (score > 0.0).then(|| ScoredHit {
                tool_id: doc.tool_id.clone(),
                namespace: doc.namespace.clone(),
                name: doc.name.clone(),
                score,
            })
        })
        .collect();

    sort_hits(&mut scored);
    scored
}

/// Canonical result ordering: score desc, then namespace, name, tool_id asc.
pub fn sort_hits(hits: &mut [ScoredHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.namespace.cmp(&b.namespace))
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| a.tool_id.cmp(&b.tool_id))
    });
}

/// Fuse a BM25 list and a semantic list with weighted Reciprocal Rank Fusion.
///
/// Each list contributes `weight / (k + rank)` per item; `semantic_weight` is
/// the semantic side's share and the BM25 side gets the complement. The BM25
/// hits supply namespace/name metadata for the fused ordering; semantic-only
/// ids that the BM25 side never saw are dropped (the index resolves hits back
/// to records anyway, so an unknown id would be unresolvable).
pub fn fuse_rrf(
    bm25: &[ScoredHit],
    semantic: &[(String, f64)],
    semantic_weight: f64,
) -> Vec<ScoredHit> {
    let bm25_weight = 1.0 - semantic_weight;
    let mut rrf: HashMap<String, f64> = HashMap::new();

    for (rank, hit) in bm25.iter().enumerate() {
        *rrf.entry(hit.tool_id.clone()).or_default() += bm25_weight / (RRF_K + rank as f64 + 1.0);
    }
    for (rank, (tool_id, _similarity)) in semantic.iter().enumerate() {
        *rrf.entry(tool_id.clone()).or_default() +=
            semantic_weight / (RRF_K + rank as f64 + 1.0);
    }

    let meta: HashMap<&str, &ScoredHit> =
        bm25.iter().map(|h| (h.tool_id.as_str(), h)).collect();

    let mut fused: Vec<ScoredHit> = rrf
        .into_iter()
        .filter_map(|(tool_id, score)| {
            meta.get(tool_id.as_str()).map(|h| ScoredHit {
                tool_id,
                namespace: h.namespace.clone(),
                name: h.name.clone(),
                score,
            })
        })
        .collect();
    sort_hits(&mut fused);
    fused
}

/// Prefix-tolerant term matching: a query term hits a document token when it
/// equals the token or is a prefix of it, so partial words ("alp") still find
/// their tools ("alpha").
fn token_matches(token: &str, term: &str) -> bool {
    token == term || token.starts_with(term)
}

/// Tokenize text into lowercase terms, splitting on non-alphanumeric characters.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(ns: &str, name: &str, desc: &str, tags: &[&str]) -> SearchDoc {
        let mut tool = Tool::new(ns, name);
        tool.description = desc.to_string();
        tool.tags = tags.iter().map(|s| s.to_string()).collect();
        build_doc(&tool)
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("get_current_time"), vec!["get", "current", "time"]);
        assert_eq!(tokenize("mcp.github"), vec!["mcp", "github"]);
        assert_eq!(tokenize("Search the WEB"), vec!["search", "the", "web"]);
    }

    #[test]
    fn test_name_match_outranks_description_match() {
        let docs = vec![
            doc("ns", "web_search", "Query the internet", &[]),
            doc("ns", "fetch_page", "Search results fetcher for the web", &[]),
        ];
        let hits = bm25_rank(&docs, "search");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].tool_id, "ns:web_search");
    }

    #[test]
    fn test_tag_match_scores() {
        let docs = vec![
            doc("ns", "alpha", "does things", &["database"]),
            doc("ns", "beta", "does other things", &[]),
        ];
        let hits = bm25_rank(&docs, "database");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].tool_id, "ns:alpha");
    }

    #[test]
    fn test_prefix_matching() {
        let docs = vec![
            doc("ns", "alpha_tool", "does alpha things", &[]),
            doc("ns", "beta_tool", "does beta things", &[]),
        ];
        let hits = bm25_rank(&docs, "alp");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].tool_id, "ns:alpha_tool");
    }

    #[test]
    fn test_no_match_returns_empty() {
        let docs = vec![doc("ns", "web_search", "Search the web", &[])];
        assert!(bm25_rank(&docs, "database").is_empty());
        assert!(bm25_rank(&docs, "").is_empty());
    }

    #[test]
    fn test_deterministic_tie_break() {
        // Identical docs under different ids must order by id.
        let docs = vec![
            doc("ns", "b_tool", "same words here", &[]),
            doc("ns", "a_tool", "same words here", &[]),
        ];
        let hits = bm25_rank(&docs, "same words");
        assert_eq!(hits[0].tool_id, "ns:a_tool");
        assert_eq!(hits[1].tool_id, "ns:b_tool");
    }

    #[test]
    fn test_rrf_fusion_prefers_agreement() {
        let bm25 = vec![
            ScoredHit { tool_id: "ns:a".into(), namespace: "ns".into(), name: "a".into(), score: 9.0 },
            ScoredHit { tool_id: "ns:b".into(), namespace: "ns".into(), name: "b".into(), score: 5.0 },
            ScoredHit { tool_id: "ns:c".into(), namespace: "ns".into(), name: "c".into(), score: 1.0 },
        ];
        // Semantic agrees with b most; b appears high in both lists.
        let semantic = vec![("ns:b".to_string(), 0.95), ("ns:a".to_string(), 0.60)];
        let fused = fuse_rrf(&bm25, &semantic, 0.5);
        assert_eq!(fused[0].tool_id, "ns:b");
        // c never appeared semantically but survives from the BM25 side.
        assert!(fused.iter().any(|h| h.tool_id == "ns:c"));
    }

    #[test]
    fn test_rrf_zero_semantic_weight_keeps_bm25_order() {
        let bm25 = vec![
            ScoredHit { tool_id: "ns:a".into(), namespace: "ns".into(), name: "a".into(), score: 9.0 },
            ScoredHit { tool_id: "ns:b".into(), namespace: "ns".into(), name: "b".into(), score: 5.0 },
        ];
        let semantic = vec![("ns:b".to_string(), 0.99)];
        let fused = fuse_rrf(&bm25, &semantic, 0.0);
        assert_eq!(fused[0].tool_id, "ns:a");
    }
}
