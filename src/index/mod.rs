//! The tool catalog: a concurrent, multi-backend registry supporting search,
//! namespace enumeration, stable cursor pagination and reconciliation.
//!
//! Uses DashMap for lock-free concurrent reads; backends register tools
//! concurrently without contention. A tool may be reachable through several
//! backends; edges are kept in insertion order and deduped by kind + name.
//! A tool whose last edge is removed becomes an orphan: still resolvable by
//! id, but excluded from search and namespace listings until the next full
//! reconciliation purges it.

pub mod cursor;
pub mod search;

use std::sync::Arc;

use dashmap::DashMap;
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::errors::{ErrorKind, ErrorObject};
use crate::model::{BackendRef, Tool};
use cursor::Cursor;
use search::{ScoredHit, SearchDoc, Searcher, bm25_rank, build_doc, fuse_rrf, sort_hits};

pub const DEFAULT_PAGE_LIMIT: usize = 20;
pub const MAX_PAGE_LIMIT: usize = 100;

/// Local index failures. Corrupt internal state is surfaced as `Internal`
/// by the callers; everything here is a client-addressable condition.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("tool '{0}' not found")]
    NotFound(String),
    #[error("invalid or stale cursor")]
    InvalidCursor,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl IndexError {
    pub fn to_error_object(&self) -> ErrorObject {
        match self {
            IndexError::NotFound(id) => {
                ErrorObject::new(ErrorKind::ToolNotFound, self.to_string()).with_tool(id.clone())
            }
            IndexError::InvalidCursor => ErrorObject::new(ErrorKind::InvalidCursor, self.to_string()),
            IndexError::InvalidArgument(_) => {
                ErrorObject::new(ErrorKind::ValidationInput, self.to_string())
            }
        }
    }
}

/// A compact search result row.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSummary {
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub summary: String,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

struct ToolRecord {
    tool: Tool,
    /// Ordered backend edges; first is the primary dispatch target.
    backends: Vec<BackendRef>,
}

/// Concurrent tool catalog. Safe for concurrent use; all edge mutation goes
/// through these APIs.
pub struct ToolIndex {
    records: DashMap<String, ToolRecord>,
    /// edge_key -> tool ids registered through that backend, insertion order.
    backend_tools: DashMap<String, Vec<String>>,
    /// Per-instance cursor epoch; restart invalidates outstanding cursors.
    epoch: String,
    searcher: Option<Arc<dyn Searcher>>,
    semantic_weight: f64,
}

impl ToolIndex {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records: DashMap::new(),
            backend_tools: DashMap::new(),
            epoch: make_epoch(),
            searcher: None,
            semantic_weight: 0.5,
        })
    }

    /// Create an index with a semantic search collaborator for hybrid
    /// BM25 + semantic ranking fused by weighted RRF.
    pub fn with_searcher(searcher: Arc<dyn Searcher>, semantic_weight: f64) -> Arc<Self> {
        Arc::new(Self {
            records: DashMap::new(),
            backend_tools: DashMap::new(),
            epoch: make_epoch(),
            searcher: Some(searcher),
            semantic_weight: semantic_weight.clamp(0.0, 1.0),
        })
    }

    /// Upsert a tool and append a backend edge (deduped by kind + name).
    /// Existing tool fields are overwritten with the latest value.
    pub fn register_tool(&self, mut tool: Tool, backend: BackendRef) {
        tool.normalize();
        let id = tool.id.clone();
        let edge = backend.edge_key();

        self.records
            .entry(id.clone())
            .and_modify(|rec| {
                rec.tool = tool.clone();
                if !rec.backends.iter().any(|b| b.edge_key() == edge) {
                    rec.backends.push(backend.clone());
                }
            })
            .or_insert_with(|| ToolRecord {
                tool,
                backends: vec![backend.clone()],
            });

        let mut ids = self.backend_tools.entry(edge).or_default();
        if !ids.iter().any(|i| i == &id) {
            ids.push(id);
        }
    }

    /// Bulk reconciliation for one MCP backend: register every current tool,
    /// then drop the edge from every tool that backend no longer reports.
    pub fn register_tools_from_backend(&self, server_name: &str, tools: Vec<Tool>) {
        let backend = BackendRef::Mcp {
            server_name: server_name.to_string(),
        };
        let edge = backend.edge_key();
        let previous: Vec<String> = self
            .backend_tools
            .get(&edge)
            .map(|ids| ids.clone())
            .unwrap_or_default();

        let mut current: Vec<String> = Vec::with_capacity(tools.len());
        for mut tool in tools {
            tool.normalize();
            current.push(tool.id.clone());
            self.register_tool(tool, backend.clone());
        }

        for gone in previous.iter().filter(|id| !current.contains(id)) {
            self.unregister_backend(gone, &backend);
        }
    }

    /// Remove one backend edge. Removing the last edge leaves the tool as an
    /// orphan: resolvable by id but excluded from discovery until purged.
    pub fn unregister_backend(&self, tool_id: &str, backend: &BackendRef) {
        let edge = backend.edge_key();
        if let Some(mut rec) = self.records.get_mut(tool_id) {
            rec.backends.retain(|b| b.edge_key() != edge);
        }
        if let Some(mut ids) = self.backend_tools.get_mut(&edge) {
            ids.retain(|i| i != tool_id);
        }
    }

    /// Drop a tool entirely, including any remaining reverse-map entries.
    pub fn remove_tool(&self, tool_id: &str) {
        self.records.remove(tool_id);
        for mut entry in self.backend_tools.iter_mut() {
            entry.value_mut().retain(|i| i != tool_id);
        }
    }

    /// GC pass run after a full reconciliation sweep: drop tools left with
    /// zero backend edges.
    pub fn purge_orphans(&self) -> usize {
        let orphaned: Vec<String> = self
            .records
            .iter()
            .filter(|r| r.value().backends.is_empty())
            .map(|r| r.key().clone())
            .collect();
        let count = orphaned.len();
        for id in orphaned {
            self.remove_tool(&id);
        }
        if count > 0 {
            warn!(purged = count, "purged orphaned tools");
        }
        count
    }

    pub fn get_tool(&self, tool_id: &str) -> Result<(Tool, Vec<BackendRef>), IndexError> {
        if tool_id.is_empty() {
            return Err(IndexError::InvalidArgument("empty tool id".to_string()));
        }
        self.records
            .get(tool_id)
            .map(|rec| (rec.tool.clone(), rec.backends.clone()))
            .ok_or_else(|| IndexError::NotFound(tool_id.to_string()))
    }

    /// Ordered backend list for a tool; empty when unknown.
    pub fn get_all_backends(&self, tool_id: &str) -> Vec<BackendRef> {
        self.records
            .get(tool_id)
            .map(|rec| rec.backends.clone())
            .unwrap_or_default()
    }

    pub fn tool_count(&self) -> usize {
        self.records.len()
    }

    /// The full deterministic result order for a query. Empty query lists all
    /// discoverable tools in (namespace, name) order; otherwise BM25 ranking,
    /// fused with the semantic collaborator when one is wired.
    fn ordered_hits(&self, query: &str) -> Vec<ScoredHit> {
        let docs: Vec<SearchDoc> = self
            .records
            .iter()
            .filter(|r| !r.value().backends.is_empty())
            .map(|r| build_doc(&r.value().tool))
            .collect();

        if query.trim().is_empty() {
            let mut hits: Vec<ScoredHit> = docs
                .into_iter()
                .map(|d| ScoredHit {
                    tool_id: d.tool_id,
                    namespace: d.namespace,
                    name: d.name,
                    score: 0.0,
                })
                .collect();
            sort_hits(&mut hits);
            return hits;
        }

        let bm25 = bm25_rank(&docs, query);
        let Some(searcher) = &self.searcher else {
            return bm25;
        };
        match searcher.search(query, MAX_PAGE_LIMIT.max(bm25.len())) {
            Ok(semantic) if !semantic.is_empty() => {
                fuse_rrf(&bm25, &semantic, self.semantic_weight)
            }
            Ok(_) => bm25,
            Err(e) => {
                // BM25 list is the baseline when the collaborator fails.
                warn!(searcher = searcher.name(), error = %e, "semantic search failed");
                bm25
            }
        }
    }

    /// Paginated search. `next_cursor` is `None` iff the returned page is the
    /// last one. Replaying a cursor under the same query on an unchanged
    /// index yields exactly the items after the previous page.
    pub fn search_page(
        &self,
        query: &str,
        limit: Option<usize>,
        cursor: Option<&str>,
    ) -> Result<(Vec<ToolSummary>, Option<String>), IndexError> {
        let limit = clamp_limit(limit);
        let hits = self.ordered_hits(query);

        let start = match cursor {
            None => 0,
            Some(token) => {
                let c = Cursor::decode(token, &self.epoch)?;
                resume_position(&hits, &c)
            }
        };

        let scored = !query.trim().is_empty();
        let end = (start + limit).min(hits.len());
        let page: Vec<ToolSummary> = hits[start..end]
            .iter()
            .filter_map(|hit| {
                // A record can vanish between ranking and resolution.
                self.records.get(&hit.tool_id).map(|rec| ToolSummary {
                    id: rec.tool.id.clone(),
                    name: rec.tool.name.clone(),
                    namespace: rec.tool.namespace.clone(),
                    summary: rec.tool.summary_line(),
                    tags: rec.tool.tags.clone(),
                    score: scored.then_some(hit.score),
                })
            })
            .collect();

        let next_cursor = (end < hits.len()).then(|| {
            let last = &hits[end - 1];
            Cursor::new(&self.epoch, encode_score(last.score), &last.tool_id).encode()
        });

        Ok((page, next_cursor))
    }

    /// Paginated namespace enumeration in lexicographic order.
    pub fn list_namespaces_page(
        &self,
        limit: Option<usize>,
        cursor: Option<&str>,
    ) -> Result<(Vec<String>, Option<String>), IndexError> {
        let limit = clamp_limit(limit);

        let mut namespaces: Vec<String> = self
            .records
            .iter()
            .filter(|r| !r.value().backends.is_empty())
            .map(|r| r.value().tool.namespace.clone())
            .collect();
        namespaces.sort();
        namespaces.dedup();

        let start = match cursor {
            None => 0,
            Some(token) => {
                let c = Cursor::decode(token, &self.epoch)?;
                match namespaces.iter().position(|ns| *ns == c.last_id) {
                    Some(pos) => pos + 1,
                    None => namespaces.partition_point(|ns| ns.as_str() <= c.last_id.as_str()),
                }
            }
        };

        let end = (start + limit).min(namespaces.len());
        let page = namespaces[start..end].to_vec();
        let next_cursor = (end < namespaces.len())
            .then(|| Cursor::new(&self.epoch, "", &namespaces[end - 1]).encode());

        Ok((page, next_cursor))
    }
}

/// Clamp a requested page size to `[1, 100]`, defaulting to 20.
pub fn clamp_limit(limit: Option<usize>) -> usize {
    match limit {
        None => DEFAULT_PAGE_LIMIT,
        Some(0) => 1,
        Some(n) => n.min(MAX_PAGE_LIMIT),
    }
}

fn make_epoch() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect()
}

fn encode_score(score: f64) -> String {
    format!("{:016x}", score.to_bits())
}

fn decode_score(sort_key: &str) -> Option<f64> {
    u64::from_str_radix(sort_key, 16).ok().map(f64::from_bits)
}

/// Find where to resume after a cursor: directly after the last-seen item,
/// or — if that item vanished — at the first item strictly after the
/// cursor's ordering key.
fn resume_position(hits: &[ScoredHit], cursor: &Cursor) -> usize {
    if let Some(pos) = hits.iter().position(|h| h.tool_id == cursor.last_id) {
        return pos + 1;
    }
    let cursor_score = decode_score(&cursor.sort_key).unwrap_or(0.0);
    let (cns, cname) = cursor
        .last_id
        .rsplit_once(':')
        .unwrap_or(("", cursor.last_id.as_str()));
    hits.iter()
        .position(|h| {
            if h.score < cursor_score {
                return true;
            }
            if h.score > cursor_score {
                return false;
            }
            (h.namespace.as_str(), h.name.as_str(), h.tool_id.as_str())
                > (cns, cname, cursor.last_id.as_str())
        })
        .unwrap_or(hits.len())
}
