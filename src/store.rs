//! Persistence boundary — spec.md §6, §7.
//!
//! `RelationalStore`, `VectorStore`, and `EmbeddingService` are the three
//! abstracted collaborators of §1/§6. `SqliteStore` is the only relational
//! implementation; the vector store and embedding service are out-of-process
//! collaborators reached over HTTP in production, and are stubbed here with
//! `Null*` implementations that make Tier C a clean no-op rather than a
//! fabricated dependency.

use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::domain::{
    Address, Decision, FeatureMap, MatchAccepted, MatchOverride, MatchResult, MatchRun, Method,
    SourceDocument, Status,
};
use crate::error::{MatchEngineError, Result};
use crate::rules::RuleSet;
use crate::similarity;

pub struct VectorItem {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: String,
}

pub struct VectorHit {
    pub id: String,
    pub score: f64,
}

/// Relational store — spec.md §6 "Relational store".
pub trait RelationalStore: Send + Sync {
    fn find_by_uprn(&self, uprn: &str) -> Result<Option<Address>>;
    fn find_by_canonical(&self, canonical: &str) -> Result<Vec<Address>>;
    fn trigram_search(
        &self,
        canonical: &str,
        min_sim: f64,
        limit: usize,
        status_in: &[Status],
    ) -> Result<Vec<(Address, f64)>>;
    fn spatial_within(
        &self,
        easting: f64,
        northing: f64,
        radius_m: f64,
        status_in: &[Status],
        limit: usize,
    ) -> Result<Vec<(Address, f64)>>;
    fn insert_address(&self, address: &Address) -> Result<()>;
    fn insert_source_document(&self, doc: &SourceDocument) -> Result<i64>;
    fn insert_match_run(&self, run: &MatchRun) -> Result<()>;
    fn complete_match_run(&self, run: &MatchRun) -> Result<()>;
    /// Appends every `MatchResult` row and at most one `MatchAccepted` upsert
    /// inside a single transaction — spec.md §5 per-document ordering
    /// guarantee.
    fn record_decision(&self, results: &[MatchResult], accepted: Option<&MatchAccepted>) -> Result<()>;
    fn get_override(&self, src_id: i64) -> Result<Option<MatchOverride>>;
    fn insert_override(&self, over: &MatchOverride) -> Result<()>;
    /// The current `MatchAccepted` row for a document, if any — the
    /// pipeline driver's re-run policy input (spec.md §4.5 "Re-run policy").
    fn get_accepted(&self, src_id: i64) -> Result<Option<MatchAccepted>>;
    fn snapshot_rules(&self, rules: &RuleSet) -> Result<()>;
    fn run_totals(&self, run_id: i64) -> Result<(u64, u64, u64, u64)>;
    fn top_candidates(&self, src_id: i64, limit: u32) -> Result<Vec<MatchResult>>;
    fn acceptance_history(&self, uprn: &str) -> Result<Vec<MatchAccepted>>;
    /// Documents with no `MatchAccepted` row yet — the pipeline driver's
    /// input set for every layer after the first.
    fn list_pending_documents(&self) -> Result<Vec<SourceDocument>>;
    fn list_documents(&self, src_ids: &[i64]) -> Result<Vec<SourceDocument>>;
    fn list_all_documents(&self) -> Result<Vec<SourceDocument>>;
}

pub trait VectorStore: Send + Sync {
    fn upsert(&self, collection: &str, items: &[VectorItem]) -> Result<()>;
    fn search(&self, collection: &str, vector: &[f32], limit: usize) -> Result<Vec<VectorHit>>;
}

pub trait EmbeddingService: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Tier C is off by default (spec.md §1 Non-goals); this implementation
/// degrades per §7 rather than panicking when accidentally invoked.
pub struct NullVectorStore;

impl VectorStore for NullVectorStore {
    fn upsert(&self, _collection: &str, _items: &[VectorItem]) -> Result<()> {
        Ok(())
    }

    fn search(&self, _collection: &str, _vector: &[f32], _limit: usize) -> Result<Vec<VectorHit>> {
        Err(MatchEngineError::Vector("vector store is not configured".to_string()))
    }
}

pub struct NullEmbeddingService;

impl EmbeddingService for NullEmbeddingService {
    fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(MatchEngineError::Embedding(
            "embedding service is not configured".to_string(),
        ))
    }
}

/// SQLite-backed relational store. Single shared connection guarded by a
/// mutex: the worker pool is CPU/IO-bound, not lock-contended, and this
/// mirrors the single-connection-plus-retry shape used elsewhere for local
/// SQLite persistence in this codebase.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    max_retries: u32,
}

impl SqliteStore {
    pub fn open(path: &std::path::Path, max_retries: u32) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| MatchEngineError::Persistence(format!("create db dir: {e}")))?;
            }
        }
        let conn = Connection::open(path)?;
        configure_connection(&conn)?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_retries,
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        configure_connection(&conn)?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_retries: 3,
        })
    }

    fn with_retry<T, F: Fn(&Connection) -> Result<T>>(&self, op: F) -> Result<T> {
        let mut attempt = 0;
        loop {
            let conn = self.conn.lock().expect("sqlite connection mutex poisoned");
            match op(&conn) {
                Ok(val) => return Ok(val),
                Err(MatchEngineError::Lookup(msg)) if msg.contains("database is locked") => {
                    drop(conn);
                    if attempt >= self.max_retries {
                        return Err(MatchEngineError::Lookup(msg));
                    }
                    attempt += 1;
                    let backoff_ms = 100 * (1u64 << (attempt - 1));
                    std::thread::sleep(std::time::Duration::from_millis(backoff_ms));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         PRAGMA busy_timeout=2500;
         PRAGMA foreign_keys=ON;",
    )?;
    Ok(())
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS address (
            uprn        TEXT PRIMARY KEY,
            full_address TEXT NOT NULL,
            canonical   TEXT NOT NULL,
            postcode    TEXT,
            usrn        TEXT,
            blpu_class  TEXT,
            status      TEXT NOT NULL,
            easting     REAL,
            northing    REAL
         );
         CREATE INDEX IF NOT EXISTS idx_address_canonical ON address(canonical);
         CREATE INDEX IF NOT EXISTS idx_address_easting_northing ON address(easting, northing);

         CREATE TABLE IF NOT EXISTS address_trigram (
            uprn    TEXT NOT NULL,
            trigram TEXT NOT NULL,
            FOREIGN KEY(uprn) REFERENCES address(uprn)
         );
         CREATE INDEX IF NOT EXISTS idx_trigram_value ON address_trigram(trigram);

         CREATE TABLE IF NOT EXISTS src_document (
            src_id      INTEGER PRIMARY KEY AUTOINCREMENT,
            source_type TEXT NOT NULL,
            raw_address TEXT NOT NULL,
            canonical   TEXT NOT NULL,
            postcode    TEXT,
            raw_uprn    TEXT,
            raw_easting REAL,
            raw_northing REAL,
            external_reference TEXT,
            doc_date    TEXT
         );
         CREATE INDEX IF NOT EXISTS idx_src_document_canonical ON src_document(canonical);

         CREATE TABLE IF NOT EXISTS match_run (
            run_id       INTEGER PRIMARY KEY,
            started_at   TEXT NOT NULL,
            completed_at TEXT,
            label        TEXT NOT NULL,
            processed    INTEGER NOT NULL DEFAULT 0,
            accepted     INTEGER NOT NULL DEFAULT 0,
            review       INTEGER NOT NULL DEFAULT 0,
            rejected     INTEGER NOT NULL DEFAULT 0,
            errored      INTEGER NOT NULL DEFAULT 0
         );

         CREATE TABLE IF NOT EXISTS match_result (
            match_id    INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id      INTEGER NOT NULL,
            src_id      INTEGER NOT NULL,
            candidate_uprn TEXT NOT NULL,
            method      TEXT NOT NULL,
            score       REAL NOT NULL,
            confidence  TEXT NOT NULL,
            tie_rank    INTEGER NOT NULL,
            features    TEXT NOT NULL,
            decision    TEXT NOT NULL,
            decided_by  TEXT NOT NULL,
            decided_at  TEXT NOT NULL,
            notes       TEXT
         );
         CREATE INDEX IF NOT EXISTS idx_match_result_src ON match_result(src_id, tie_rank);

         CREATE TABLE IF NOT EXISTS match_accepted (
            src_id      INTEGER PRIMARY KEY,
            uprn        TEXT NOT NULL,
            method      TEXT NOT NULL,
            score       REAL NOT NULL,
            confidence  TEXT NOT NULL,
            run_id      INTEGER NOT NULL,
            accepted_by TEXT NOT NULL,
            accepted_at TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_match_accepted_uprn ON match_accepted(uprn);

         CREATE TABLE IF NOT EXISTS match_override (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            src_id      INTEGER NOT NULL,
            uprn        TEXT NOT NULL,
            reason      TEXT NOT NULL,
            actor       TEXT NOT NULL,
            decided_at  TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_match_override_src ON match_override(src_id, decided_at DESC);

         CREATE TABLE IF NOT EXISTS normalisation_rule (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id      INTEGER NOT NULL,
            pattern     TEXT NOT NULL,
            replacement TEXT NOT NULL,
            rule_type   TEXT NOT NULL,
            priority    INTEGER NOT NULL
         );",
    )?;
    Ok(())
}

fn row_to_address(row: &rusqlite::Row) -> rusqlite::Result<Address> {
    let status_str: String = row.get("status")?;
    Ok(Address {
        uprn: row.get("uprn")?,
        full_address: row.get("full_address")?,
        canonical: row.get("canonical")?,
        postcode: row.get("postcode")?,
        usrn: row.get("usrn")?,
        blpu_class: row.get("blpu_class")?,
        status: Status::parse(&status_str).unwrap_or(Status::Historic),
        easting: row.get("easting")?,
        northing: row.get("northing")?,
    })
}

fn row_to_source_document(row: &rusqlite::Row) -> rusqlite::Result<SourceDocument> {
    let doc_date: Option<String> = row.get("doc_date")?;
    Ok(SourceDocument {
        src_id: row.get("src_id")?,
        source_type: row.get("source_type")?,
        raw_address: row.get("raw_address")?,
        canonical: row.get("canonical")?,
        postcode: row.get("postcode")?,
        raw_uprn: row.get("raw_uprn")?,
        raw_easting: row.get("raw_easting")?,
        raw_northing: row.get("raw_northing")?,
        external_reference: row.get("external_reference")?,
        doc_date: doc_date.and_then(|d| chrono::NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()),
    })
}

fn status_placeholders(status_in: &[Status]) -> String {
    status_in
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(",")
}

impl RelationalStore for SqliteStore {
    fn find_by_uprn(&self, uprn: &str) -> Result<Option<Address>> {
        self.with_retry(|conn| {
            conn.query_row(
                "SELECT * FROM address WHERE uprn = ?1",
                params![uprn],
                row_to_address,
            )
            .optional()
            .map_err(MatchEngineError::from)
        })
    }

    fn find_by_canonical(&self, canonical: &str) -> Result<Vec<Address>> {
        self.with_retry(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM address WHERE canonical = ?1")?;
            let rows = stmt
                .query_map(params![canonical], row_to_address)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    fn trigram_search(
        &self,
        canonical: &str,
        min_sim: f64,
        limit: usize,
        status_in: &[Status],
    ) -> Result<Vec<(Address, f64)>> {
        if canonical.chars().count() < 5 {
            return Ok(Vec::new());
        }
        let grams: Vec<String> = similarity::trigrams(canonical).into_iter().collect();
        if grams.is_empty() {
            return Ok(Vec::new());
        }
        self.with_retry(|conn| {
            let placeholders = grams.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            let status_clause = status_placeholders(status_in);
            let sql = format!(
                "SELECT DISTINCT a.* FROM address a
                 JOIN address_trigram t ON t.uprn = a.uprn
                 WHERE t.trigram IN ({placeholders}) AND a.status IN ({status_clause})"
            );
            let mut stmt = conn.prepare(&sql)?;
            let gram_params: Vec<&dyn rusqlite::ToSql> =
                grams.iter().map(|g| g as &dyn rusqlite::ToSql).collect();
            let rows = stmt
                .query_map(gram_params.as_slice(), row_to_address)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut scored: Vec<(Address, f64)> = rows
                .into_iter()
                .map(|addr| {
                    let sim = similarity::trigram_similarity(canonical, &addr.canonical);
                    (addr, sim)
                })
                .filter(|(_, sim)| *sim >= min_sim)
                .collect();
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            scored.truncate(limit);
            Ok(scored)
        })
    }

    fn spatial_within(
        &self,
        easting: f64,
        northing: f64,
        radius_m: f64,
        status_in: &[Status],
        limit: usize,
    ) -> Result<Vec<(Address, f64)>> {
        self.with_retry(|conn| {
            let status_clause = status_placeholders(status_in);
            let sql = format!(
                "SELECT * FROM address
                 WHERE easting BETWEEN ?1 AND ?2 AND northing BETWEEN ?3 AND ?4
                 AND status IN ({status_clause})"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(
                    params![easting - radius_m, easting + radius_m, northing - radius_m, northing + radius_m],
                    row_to_address,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut scored: Vec<(Address, f64)> = rows
                .into_iter()
                .filter_map(|addr| {
                    let (e, n) = (addr.easting?, addr.northing?);
                    let distance = ((e - easting).powi(2) + (n - northing).powi(2)).sqrt();
                    (distance <= radius_m).then_some((addr, distance))
                })
                .collect();
            scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
            scored.truncate(limit);
            Ok(scored)
        })
    }

    fn insert_address(&self, address: &Address) -> Result<()> {
        self.with_retry(|conn| {
            conn.execute(
                "INSERT INTO address (uprn, full_address, canonical, postcode, usrn, blpu_class, status, easting, northing)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(uprn) DO UPDATE SET
                    full_address=excluded.full_address, canonical=excluded.canonical,
                    postcode=excluded.postcode, usrn=excluded.usrn, blpu_class=excluded.blpu_class,
                    status=excluded.status, easting=excluded.easting, northing=excluded.northing",
                params![
                    address.uprn,
                    address.full_address,
                    address.canonical,
                    address.postcode,
                    address.usrn,
                    address.blpu_class,
                    address.status.as_str(),
                    address.easting,
                    address.northing,
                ],
            )?;
            conn.execute("DELETE FROM address_trigram WHERE uprn = ?1", params![address.uprn])?;
            for gram in similarity::trigrams(&address.canonical) {
                conn.execute(
                    "INSERT INTO address_trigram (uprn, trigram) VALUES (?1, ?2)",
                    params![address.uprn, gram],
                )?;
            }
            Ok(())
        })
    }

    fn insert_source_document(&self, doc: &SourceDocument) -> Result<i64> {
        self.with_retry(|conn| {
            conn.execute(
                "INSERT INTO src_document (source_type, raw_address, canonical, postcode, raw_uprn, raw_easting, raw_northing, external_reference, doc_date)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    doc.source_type,
                    doc.raw_address,
                    doc.canonical,
                    doc.postcode,
                    doc.raw_uprn,
                    doc.raw_easting,
                    doc.raw_northing,
                    doc.external_reference,
                    doc.doc_date.map(|d| d.to_string()),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    fn insert_match_run(&self, run: &MatchRun) -> Result<()> {
        self.with_retry(|conn| {
            conn.execute(
                "INSERT INTO match_run (run_id, started_at, label) VALUES (?1, ?2, ?3)",
                params![run.run_id, run.started_at.to_rfc3339(), run.label],
            )?;
            Ok(())
        })
    }

    fn complete_match_run(&self, run: &MatchRun) -> Result<()> {
        self.with_retry(|conn| {
            conn.execute(
                "UPDATE match_run SET completed_at=?2, processed=?3, accepted=?4, review=?5, rejected=?6, errored=?7
                 WHERE run_id=?1",
                params![
                    run.run_id,
                    run.completed_at.map(|d| d.to_rfc3339()),
                    run.processed,
                    run.accepted,
                    run.review,
                    run.rejected,
                    run.errored,
                ],
            )?;
            Ok(())
        })
    }

    fn record_decision(&self, results: &[MatchResult], accepted: Option<&MatchAccepted>) -> Result<()> {
        self.with_retry(|conn| {
            let tx = conn.unchecked_transaction()?;
            for result in results {
                let features_json = serde_json::to_string(&result.features).map_err(|e| {
                    MatchEngineError::Persistence(format!("serialise features: {e}"))
                })?;
                tx.execute(
                    "INSERT INTO match_result (run_id, src_id, candidate_uprn, method, score, confidence, tie_rank, features, decision, decided_by, decided_at, notes)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    params![
                        result.run_id,
                        result.src_id,
                        result.candidate_uprn,
                        result.method.as_str(),
                        result.score,
                        result.confidence.as_str(),
                        result.tie_rank,
                        features_json,
                        result.decision.as_str(),
                        result.decided_by,
                        result.decided_at.to_rfc3339(),
                        result.notes,
                    ],
                )?;
            }
            if let Some(acc) = accepted {
                tx.execute(
                    "INSERT INTO match_accepted (src_id, uprn, method, score, confidence, run_id, accepted_by, accepted_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(src_id) DO UPDATE SET
                        uprn=excluded.uprn, method=excluded.method, score=excluded.score,
                        confidence=excluded.confidence, run_id=excluded.run_id,
                        accepted_by=excluded.accepted_by, accepted_at=excluded.accepted_at",
                    params![
                        acc.src_id,
                        acc.uprn,
                        acc.method.as_str(),
                        acc.score,
                        acc.confidence.as_str(),
                        acc.run_id,
                        acc.accepted_by,
                        acc.accepted_at.to_rfc3339(),
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    fn get_override(&self, src_id: i64) -> Result<Option<MatchOverride>> {
        self.with_retry(|conn| {
            conn.query_row(
                "SELECT uprn, reason, actor, decided_at FROM match_override
                 WHERE src_id = ?1 ORDER BY decided_at DESC LIMIT 1",
                params![src_id],
                |row| {
                    let decided_at: String = row.get(3)?;
                    Ok(MatchOverride {
                        src_id,
                        uprn: row.get(0)?,
                        reason: row.get(1)?,
                        actor: row.get(2)?,
                        decided_at: chrono::DateTime::parse_from_rfc3339(&decided_at)
                            .map(|d| d.with_timezone(&chrono::Utc))
                            .unwrap_or_else(|_| chrono::Utc::now()),
                    })
                },
            )
            .optional()
            .map_err(MatchEngineError::from)
        })
    }

    fn insert_override(&self, over: &MatchOverride) -> Result<()> {
        self.with_retry(|conn| {
            conn.execute(
                "INSERT INTO match_override (src_id, uprn, reason, actor, decided_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![over.src_id, over.uprn, over.reason, over.actor, over.decided_at.to_rfc3339()],
            )?;
            Ok(())
        })
    }

    fn snapshot_rules(&self, rules: &RuleSet) -> Result<()> {
        self.with_retry(|conn| {
            for rule in rules.abbreviations() {
                conn.execute(
                    "INSERT INTO normalisation_rule (run_id, pattern, replacement, rule_type, priority)
                     VALUES (?1, ?2, ?3, 'abbreviation', ?4)",
                    params![rules.version, rule.pattern, rule.replacement, rule.priority],
                )?;
            }
            Ok(())
        })
    }

    fn run_totals(&self, run_id: i64) -> Result<(u64, u64, u64, u64)> {
        self.with_retry(|conn| {
            conn.query_row(
                "SELECT processed, accepted, review, rejected FROM match_run WHERE run_id = ?1",
                params![run_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)? as u64,
                        row.get::<_, i64>(1)? as u64,
                        row.get::<_, i64>(2)? as u64,
                        row.get::<_, i64>(3)? as u64,
                    ))
                },
            )
            .map_err(MatchEngineError::from)
        })
    }

    fn top_candidates(&self, src_id: i64, limit: u32) -> Result<Vec<MatchResult>> {
        self.with_retry(|conn| {
            let mut stmt = conn.prepare(
                "SELECT match_id, run_id, src_id, candidate_uprn, method, score, confidence, tie_rank, features, decision, decided_by, decided_at, notes
                 FROM match_result WHERE src_id = ?1 ORDER BY tie_rank ASC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![src_id, limit], row_to_match_result)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    fn acceptance_history(&self, uprn: &str) -> Result<Vec<MatchAccepted>> {
        self.with_retry(|conn| {
            let mut stmt = conn.prepare(
                "SELECT src_id, uprn, method, score, confidence, run_id, accepted_by, accepted_at
                 FROM match_accepted WHERE uprn = ?1",
            )?;
            let rows = stmt
                .query_map(params![uprn], |row| {
                    let method_str: String = row.get(2)?;
                    let confidence_str: String = row.get(4)?;
                    let accepted_at: String = row.get(7)?;
                    Ok(MatchAccepted {
                        src_id: row.get(0)?,
                        uprn: row.get(1)?,
                        method: parse_method(&method_str),
                        score: row.get(3)?,
                        confidence: parse_decision(&confidence_str),
                        run_id: row.get(5)?,
                        accepted_by: row.get(6)?,
                        accepted_at: chrono::DateTime::parse_from_rfc3339(&accepted_at)
                            .map(|d| d.with_timezone(&chrono::Utc))
                            .unwrap_or_else(|_| chrono::Utc::now()),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    fn get_accepted(&self, src_id: i64) -> Result<Option<MatchAccepted>> {
        self.with_retry(|conn| {
            conn.query_row(
                "SELECT src_id, uprn, method, score, confidence, run_id, accepted_by, accepted_at
                 FROM match_accepted WHERE src_id = ?1",
                params![src_id],
                |row| {
                    let method_str: String = row.get(2)?;
                    let confidence_str: String = row.get(4)?;
                    let accepted_at: String = row.get(7)?;
                    Ok(MatchAccepted {
                        src_id: row.get(0)?,
                        uprn: row.get(1)?,
                        method: parse_method(&method_str),
                        score: row.get(3)?,
                        confidence: parse_decision(&confidence_str),
                        run_id: row.get(5)?,
                        accepted_by: row.get(6)?,
                        accepted_at: chrono::DateTime::parse_from_rfc3339(&accepted_at)
                            .map(|d| d.with_timezone(&chrono::Utc))
                            .unwrap_or_else(|_| chrono::Utc::now()),
                    })
                },
            )
            .optional()
            .map_err(MatchEngineError::from)
        })
    }

    fn list_pending_documents(&self) -> Result<Vec<SourceDocument>> {
        self.with_retry(|conn| {
            let mut stmt = conn.prepare(
                "SELECT d.* FROM src_document d
                 LEFT JOIN match_accepted a ON a.src_id = d.src_id
                 WHERE a.src_id IS NULL
                 ORDER BY d.src_id ASC",
            )?;
            let rows = stmt
                .query_map([], row_to_source_document)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    fn list_documents(&self, src_ids: &[i64]) -> Result<Vec<SourceDocument>> {
        if src_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.with_retry(|conn| {
            let placeholders = src_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            let sql = format!("SELECT * FROM src_document WHERE src_id IN ({placeholders})");
            let mut stmt = conn.prepare(&sql)?;
            let id_params: Vec<&dyn rusqlite::ToSql> =
                src_ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
            let rows = stmt
                .query_map(id_params.as_slice(), row_to_source_document)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    fn list_all_documents(&self) -> Result<Vec<SourceDocument>> {
        self.with_retry(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM src_document ORDER BY src_id ASC")?;
            let rows = stmt
                .query_map([], row_to_source_document)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}

fn row_to_match_result(row: &rusqlite::Row) -> rusqlite::Result<MatchResult> {
    let method_str: String = row.get(4)?;
    let confidence_str: String = row.get(6)?;
    let decision_str: String = row.get(9)?;
    let decided_at: String = row.get(11)?;
    let features_json: String = row.get(8)?;
    let features: FeatureMap = serde_json::from_str(&features_json).unwrap_or_default();
    Ok(MatchResult {
        match_id: row.get(0)?,
        run_id: row.get(1)?,
        src_id: row.get(2)?,
        candidate_uprn: row.get(3)?,
        method: parse_method(&method_str),
        score: row.get(5)?,
        confidence: parse_decision(&confidence_str),
        tie_rank: row.get(7)?,
        features,
        decision: parse_decision(&decision_str),
        decided_by: row.get(10)?,
        decided_at: chrono::DateTime::parse_from_rfc3339(&decided_at)
            .map(|d| d.with_timezone(&chrono::Utc))
            .unwrap_or_else(|_| chrono::Utc::now()),
        notes: row.get(12)?,
    })
}

fn parse_method(s: &str) -> Method {
    match s {
        "valid_uprn" => Method::ValidUprn,
        "exact_canonical" => Method::ExactCanonical,
        "trigram_fuzzy" => Method::TrigramFuzzy,
        "vector_semantic" => Method::VectorSemantic,
        "spatial_search" => Method::SpatialSearch,
        _ => Method::ManualOverride,
    }
}

fn parse_decision(s: &str) -> Decision {
    match s {
        "auto_accepted" => Decision::AutoAccepted,
        "needs_review" => Decision::NeedsReview,
        _ => Decision::Rejected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_address(uprn: &str, canonical: &str, status: Status) -> Address {
        Address {
            uprn: uprn.to_string(),
            full_address: canonical.to_string(),
            canonical: canonical.to_string(),
            postcode: Some("GU341AA".to_string()),
            usrn: None,
            blpu_class: Some("RD04".to_string()),
            status,
            easting: Some(100.0),
            northing: Some(200.0),
        }
    }

    #[test]
    fn insert_and_find_by_uprn_round_trips() {
        let store = SqliteStore::open_in_memory().unwrap();
        let addr = sample_address("100023405", "12 HIGH STREET ALTON", Status::Live);
        store.insert_address(&addr).unwrap();
        let found = store.find_by_uprn("100023405").unwrap().unwrap();
        assert_eq!(found.canonical, "12 HIGH STREET ALTON");
    }

    #[test]
    fn find_by_uprn_missing_returns_none() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.find_by_uprn("999").unwrap().is_none());
    }

    #[test]
    fn trigram_search_finds_similar_canonical() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert_address(&sample_address("1", "12 HIGH STREET ALTON", Status::Live))
            .unwrap();
        store
            .insert_address(&sample_address("2", "99 LONDON ROAD LISS", Status::Live))
            .unwrap();
        let hits = store
            .trigram_search("12 HIGH STREET ALTON", 0.30, 50, &[Status::Live])
            .unwrap();
        assert!(hits.iter().any(|(a, _)| a.uprn == "1"));
        assert!(!hits.iter().any(|(a, _)| a.uprn == "2"));
    }

    #[test]
    fn spatial_within_filters_by_radius() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut near = sample_address("1", "1 NEAR ROAD", Status::Live);
        near.easting = Some(100.0);
        near.northing = Some(200.0);
        let mut far = sample_address("2", "2 FAR ROAD", Status::Live);
        far.easting = Some(10_100.0);
        far.northing = Some(10_200.0);
        store.insert_address(&near).unwrap();
        store.insert_address(&far).unwrap();
        let hits = store.spatial_within(100.0, 200.0, 200.0, &[Status::Live], 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.uprn, "1");
    }

    #[test]
    fn record_decision_is_transactional() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = chrono::Utc::now();
        let result = MatchResult {
            match_id: None,
            run_id: 1,
            src_id: 1,
            candidate_uprn: "1".to_string(),
            method: Method::TrigramFuzzy,
            score: 0.95,
            confidence: Decision::AutoAccepted,
            tie_rank: 1,
            features: FeatureMap::new(),
            decision: Decision::AutoAccepted,
            decided_by: "pipeline".to_string(),
            decided_at: now,
            notes: None,
        };
        let accepted = MatchAccepted {
            src_id: 1,
            uprn: "1".to_string(),
            method: Method::TrigramFuzzy,
            score: 0.95,
            confidence: Decision::AutoAccepted,
            run_id: 1,
            accepted_by: "pipeline".to_string(),
            accepted_at: now,
        };
        store.record_decision(&[result], Some(&accepted)).unwrap();
        let top = store.top_candidates(1, 3).unwrap();
        assert_eq!(top.len(), 1);
        let history = store.acceptance_history("1").unwrap();
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn override_short_circuits_are_queryable() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.get_override(42).unwrap().is_none());
        store
            .insert_override(&MatchOverride {
                src_id: 42,
                uprn: "7".to_string(),
                reason: "manual QA".to_string(),
                actor: "operator".to_string(),
                decided_at: chrono::Utc::now(),
            })
            .unwrap();
        let over = store.get_override(42).unwrap().unwrap();
        assert_eq!(over.uprn, "7");
    }
}
