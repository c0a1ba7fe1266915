//! Optional citation graph.
//!
//! Papers and directed CITES edges, backed by SQLite when a database path is
//! configured.  Without a backend the graph degrades gracefully: writes are
//! no-ops and [`CitationGraph::neighbors`] returns empty sets, so callers
//! never branch on availability.
//!
//! The connection sits behind an `Arc<Mutex<_>>` and every operation runs on
//! the blocking pool, keeping the async runtime unblocked during disk I/O.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{KnowledgeError, Result};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Reference to a paper in a citation neighborhood.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaperRef {
    pub id: String,
    pub title: String,
}

/// The two directions of a paper's citation neighborhood.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CitationNeighborhood {
    /// Papers that cite this paper.
    pub cited_by: Vec<PaperRef>,
    /// Papers this paper cites.
    pub cites: Vec<PaperRef>,
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS papers (
    id       TEXT PRIMARY KEY,
    title    TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}'
);
CREATE TABLE IF NOT EXISTS citations (
    citing TEXT NOT NULL,
    cited  TEXT NOT NULL,
    UNIQUE (citing, cited)
);
CREATE INDEX IF NOT EXISTS idx_citations_cited ON citations (cited);
";

/// SQLite-backed citation graph, or a disabled stand-in.
#[derive(Clone)]
pub struct CitationGraph {
    conn: Option<Arc<Mutex<Connection>>>,
}

impl CitationGraph {
    /// A graph with no backend: writes are dropped, reads are empty.
    pub fn disabled() -> Self {
        Self { conn: None }
    }

    /// Open (or create) the graph database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        info!(path = %path.display(), "citation graph opened");
        Ok(Self {
            conn: Some(Arc::new(Mutex::new(conn))),
        })
    }

    /// In-memory graph, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Some(Arc::new(Mutex::new(conn))),
        })
    }

    /// Whether a backend is configured.
    pub fn is_enabled(&self) -> bool {
        self.conn.is_some()
    }

    /// Run `f` against the connection on the blocking pool.
    async fn execute<F, T>(&self, f: F) -> Result<Option<T>>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let Some(conn) = self.conn.as_ref().map(Arc::clone) else {
            return Ok(None);
        };
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| KnowledgeError::TaskJoin(format!("mutex poisoned: {e}")))?;
            f(&conn).map(Some)
        })
        .await?
    }

    /// Upsert a paper node.  Orphan nodes (no edges) are fine.
    pub async fn add_paper(
        &self,
        id: &str,
        title: Option<&str>,
        metadata: &Value,
    ) -> Result<()> {
        let id = id.to_owned();
        let title = title.unwrap_or(&id).to_owned();
        let metadata = metadata.to_string();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO papers (id, title, metadata) VALUES (?1, ?2, ?3)
                 ON CONFLICT (id) DO UPDATE SET title = ?2, metadata = ?3",
                rusqlite::params![id, title, metadata],
            )?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Record that `citing` cites `cited`.  Idempotent.
    pub async fn add_citation(&self, citing: &str, cited: &str) -> Result<()> {
        let citing = citing.to_owned();
        let cited = cited.to_owned();
        self.execute(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO citations (citing, cited) VALUES (?1, ?2)",
                rusqlite::params![citing, cited],
            )?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Both directions of the neighborhood around `id`.
    pub async fn neighbors(&self, id: &str) -> Result<CitationNeighborhood> {
        let id = id.to_owned();
        let result = self
            .execute(move |conn| {
                let cited_by = query_refs(
                    conn,
                    "SELECT p.id, p.title FROM citations c
                     JOIN papers p ON p.id = c.citing
                     WHERE c.cited = ?1 ORDER BY p.id",
                    &id,
                )?;
                let cites = query_refs(
                    conn,
                    "SELECT p.id, p.title FROM citations c
                     JOIN papers p ON p.id = c.cited
                     WHERE c.citing = ?1 ORDER BY p.id",
                    &id,
                )?;
                Ok(CitationNeighborhood { cited_by, cites })
            })
            .await?;
        Ok(result.unwrap_or_default())
    }

    /// Delete a paper and detach all of its edges.
    pub async fn delete_paper(&self, id: &str) -> Result<()> {
        let id = id.to_owned();
        let deleted = self
            .execute(move |conn| {
                conn.execute(
                    "DELETE FROM citations WHERE citing = ?1 OR cited = ?1",
                    rusqlite::params![id],
                )?;
                let n = conn.execute("DELETE FROM papers WHERE id = ?1", rusqlite::params![id])?;
                Ok(n)
            })
            .await?;
        if let Some(n) = deleted {
            debug!(removed = n, "paper deleted from citation graph");
        }
        Ok(())
    }
}

fn query_refs(conn: &Connection, sql: &str, id: &str) -> Result<Vec<PaperRef>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(rusqlite::params![id], |row| {
        Ok(PaperRef {
            id: row.get(0)?,
            title: row.get(1)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn disabled_graph_is_a_silent_noop() {
        let graph = CitationGraph::disabled();
        assert!(!graph.is_enabled());

        graph.add_paper("p1", Some("Paper 1"), &json!({})).await.unwrap();
        graph.add_citation("p1", "p2").await.unwrap();
        graph.delete_paper("p1").await.unwrap();

        let n = graph.neighbors("p1").await.unwrap();
        assert!(n.cited_by.is_empty());
        assert!(n.cites.is_empty());
    }

    #[tokio::test]
    async fn neighbors_report_both_directions() {
        let graph = CitationGraph::open_in_memory().unwrap();
        graph.add_paper("a", Some("Paper A"), &json!({})).await.unwrap();
        graph.add_paper("b", Some("Paper B"), &json!({})).await.unwrap();
        graph.add_paper("c", Some("Paper C"), &json!({})).await.unwrap();
        graph.add_citation("a", "b").await.unwrap();
        graph.add_citation("c", "b").await.unwrap();

        let n = graph.neighbors("b").await.unwrap();
        assert_eq!(
            n.cited_by,
            vec![
                PaperRef { id: "a".into(), title: "Paper A".into() },
                PaperRef { id: "c".into(), title: "Paper C".into() },
            ]
        );
        assert!(n.cites.is_empty());

        let n = graph.neighbors("a").await.unwrap();
        assert_eq!(n.cites.len(), 1);
        assert_eq!(n.cites[0].id, "b");
    }

    #[tokio::test]
    async fn add_paper_is_an_upsert() {
        let graph = CitationGraph::open_in_memory().unwrap();
        graph.add_paper("a", Some("Old Title"), &json!({})).await.unwrap();
        graph.add_paper("a", Some("New Title"), &json!({"v": 2})).await.unwrap();
        graph.add_paper("b", None, &json!({})).await.unwrap();
        graph.add_citation("b", "a").await.unwrap();

        let n = graph.neighbors("a").await.unwrap();
        assert_eq!(n.cited_by[0].title, "b");
    }

    #[tokio::test]
    async fn delete_detaches_edges() {
        let graph = CitationGraph::open_in_memory().unwrap();
        graph.add_paper("a", None, &json!({})).await.unwrap();
        graph.add_paper("b", None, &json!({})).await.unwrap();
        graph.add_citation("a", "b").await.unwrap();

        graph.delete_paper("b").await.unwrap();
        let n = graph.neighbors("a").await.unwrap();
        assert!(n.cites.is_empty());
        assert!(n.cited_by.is_empty());
    }

    #[tokio::test]
    async fn duplicate_citations_collapse() {
        let graph = CitationGraph::open_in_memory().unwrap();
        graph.add_paper("a", None, &json!({})).await.unwrap();
        graph.add_paper("b", None, &json!({})).await.unwrap();
        graph.add_citation("a", "b").await.unwrap();
        graph.add_citation("a", "b").await.unwrap();

        let n = graph.neighbors("b").await.unwrap();
        assert_eq!(n.cited_by.len(), 1);
    }
}
