//! Pipeline Driver — spec.md §4.6, §5.
//!
//! A bounded worker pool drains documents through the candidate generator and
//! decision engine; a single collector thread owns the `MatchRun` counters
//! and performs the one transactional write per document. Workers never
//! write to the store except through the collector, so ordering (§5:
//! `MatchResult` rows before `MatchAccepted`, in one transaction) holds by
//! construction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{info, warn};

use crate::candidates::CandidateGenerator;
use crate::config::Config;
use crate::decision::{self, decide, rerun_policy, RerunDecision};
use crate::domain::{Decision, MatchAccepted, MatchResult, MatchRun, Method, SourceDocument};
use crate::error::Result;
use crate::rules::RuleSet;
use crate::store::{EmbeddingService, RelationalStore, VectorStore};

/// Shared, run-scoped stop signal. Cloning is cheap (`Arc` underneath); every
/// worker polls it between documents.
#[derive(Clone)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

pub enum Layer {
    Deterministic,
    FuzzyGroup,
    FuzzyIndividual,
    Conservative,
}

struct WorkItem {
    document: SourceDocument,
}

struct WorkResult {
    src_id: i64,
    outcome: Option<decision::Outcome>,
    error: Option<String>,
}

pub struct Pipeline<'a> {
    pub store: &'a (dyn RelationalStore + Sync),
    pub vector_store: &'a (dyn VectorStore + Sync),
    pub embedder: &'a (dyn EmbeddingService + Sync),
    pub rules: &'a RuleSet,
    pub config: &'a Config,
}

impl<'a> Pipeline<'a> {
    /// Runs one layer of spec.md §4.6 over `documents`, writing per-layer
    /// counts to `run` as it goes. Returns the src_ids that remain
    /// unaccepted after this layer (candidates for the next layer).
    pub fn run_layer(
        &self,
        run: &mut MatchRun,
        layer: Layer,
        documents: Vec<SourceDocument>,
        cancellation: &CancellationToken,
    ) -> Result<Vec<i64>> {
        let worker_count = self.config.runtime.resolved_worker_count();
        let channel_capacity = self.config.runtime.channel_capacity;

        let (work_tx, work_rx) = mpsc::sync_channel::<WorkItem>(channel_capacity);
        let (result_tx, result_rx) = mpsc::sync_channel::<WorkResult>(channel_capacity);
        let work_rx = Mutex::new(work_rx);

        // Group-fuzzy mode collapses by canonical and applies the outcome to
        // every document in the group (spec.md §4.6 Layer 3).
        let grouped = matches!(layer, Layer::FuzzyGroup);
        let conservative = matches!(layer, Layer::Conservative);
        let tier_a_only = matches!(layer, Layer::Deterministic);

        let total = documents.len();
        let mut pending_groups: HashMap<String, Vec<i64>> = HashMap::new();
        if grouped {
            for doc in &documents {
                pending_groups.entry(doc.canonical.clone()).or_default().push(doc.src_id);
            }
        }
        let dispatch_docs = if grouped {
            dedup_by_canonical(documents)
        } else {
            documents
        };

        let mut carry_forward = Vec::new();

        // Scoped threads borrow `self`/`cancellation` directly — no `Arc`
        // promotion to `'static` needed, and the scope joins every worker
        // before returning.
        thread::scope(|scope| {
            for _ in 0..worker_count {
                let work_rx = &work_rx;
                let result_tx = result_tx.clone();
                let cancellation = cancellation.clone();
                let base_thresholds = self.config.thresholds.clone();
                let weights = self.config.weights.clone();
                let collaborators = self.config.collaborators.clone();
                let tier_a_only = tier_a_only;

                scope.spawn(move || {
                    let generator = CandidateGenerator {
                        store: self.store,
                        vector_store: self.vector_store,
                        embedder: self.embedder,
                        rules: self.rules,
                        thresholds: &base_thresholds,
                        weights: &weights,
                        collaborators: &collaborators,
                    };
                    loop {
                        if cancellation.is_cancelled() {
                            break;
                        }
                        let item = {
                            let rx = work_rx.lock().expect("work channel mutex poisoned");
                            rx.recv()
                        };
                        let Ok(item) = item else { break };

                        let src_id = item.document.src_id;
                        let thresholds = if conservative {
                            conservative_thresholds(&base_thresholds)
                        } else {
                            base_thresholds.clone()
                        };

                        let doc_coords = (item.document.raw_easting, item.document.raw_northing);
                        let outcome = generator
                            .generate(&item.document, tier_a_only)
                            .map(|mut candidates| {
                                if conservative {
                                    candidates.retain(|c| passes_conservative(c, &thresholds, doc_coords));
                                }
                                decide(&candidates, &thresholds)
                            });

                        let result = match outcome {
                            Ok(outcome) => WorkResult { src_id, outcome: Some(outcome), error: None },
                            Err(e) => WorkResult { src_id, outcome: None, error: Some(e.to_string()) },
                        };
                        if result_tx.send(result).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(result_tx);

            scope.spawn(move || {
                for document in dispatch_docs {
                    if work_tx.send(WorkItem { document }).is_err() {
                        break;
                    }
                }
            });

            let mut processed = 0u64;
            while let Ok(result) = result_rx.recv() {
                processed += 1;
                if processed % 1000 == 0 {
                    info!(processed, total, "pipeline progress");
                }

                match (result.outcome, result.error) {
                    (Some(outcome), _) => {
                        self.record(run, result.src_id, &outcome);
                        if outcome.decision != Decision::AutoAccepted {
                            carry_forward.push(result.src_id);
                        }
                    }
                    (None, Some(err)) => {
                        warn!(src_id = result.src_id, error = %err, "document processing error");
                        run.errored += 1;
                        carry_forward.push(result.src_id);
                    }
                    (None, None) => unreachable!("worker always sets outcome or error"),
                }
                run.processed += 1;
            }
        });

        if grouped {
            let mut expanded = Vec::new();
            for src_id in carry_forward {
                if let Some(group) = pending_groups.values().find(|g| g.contains(&src_id)) {
                    expanded.extend(group.iter().copied());
                } else {
                    expanded.push(src_id);
                }
            }
            expanded.sort_unstable();
            expanded.dedup();
            return Ok(expanded);
        }

        Ok(carry_forward)
    }

    fn record(&self, run: &mut MatchRun, src_id: i64, outcome: &decision::Outcome) {
        let now = decision::decided_at();
        let results: Vec<MatchResult> = outcome
            .results
            .iter()
            .map(|r| MatchResult {
                match_id: None,
                run_id: run.run_id,
                src_id,
                candidate_uprn: r.uprn.clone(),
                method: r.method,
                score: r.score,
                confidence: outcome.decision,
                tie_rank: r.tie_rank,
                features: r.features.clone(),
                decision: outcome.decision,
                decided_by: "pipeline".to_string(),
                decided_at: now,
                notes: None,
            })
            .collect();

        let fresh = outcome.accepted_uprn.as_ref().map(|uprn| MatchAccepted {
            src_id,
            uprn: uprn.clone(),
            method: outcome.accepted_method.unwrap_or(Method::TrigramFuzzy),
            score: outcome.accepted_score.unwrap_or(0.0),
            confidence: outcome.decision,
            run_id: run.run_id,
            accepted_by: "pipeline".to_string(),
            accepted_at: now,
        });

        // spec.md §4.5: the overrides table is read first and short-circuits
        // acceptance unconditionally — even when this run's own fresh
        // decision is needs_review/rejected, a standing override still wins.
        // Absent an override, an existing acceptance is only superseded by a
        // sufficiently stronger new score; otherwise the new decision is
        // still recorded for audit but not promoted to `MatchAccepted`.
        let accepted = match self.resolve_acceptance(src_id, run.run_id, now, fresh) {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(src_id, error = %e, "persistence error checking override/re-run policy");
                run.errored += 1;
                return;
            }
        };

        if let Err(e) = self.store.record_decision(&results, accepted.as_ref()) {
            warn!(src_id, error = %e, "persistence error recording decision");
            run.errored += 1;
            return;
        }

        match outcome.decision {
            Decision::AutoAccepted => run.accepted += 1,
            Decision::NeedsReview => run.review += 1,
            Decision::Rejected => run.rejected += 1,
        }
    }

    /// Resolves what (if anything) should be written as `MatchAccepted` for
    /// this document: a standing manual override always wins, regardless of
    /// whether `fresh` carries this run's own acceptance. Absent an
    /// override, applies spec.md §4.5's re-run policy against whatever prior
    /// acceptance the store already holds.
    fn resolve_acceptance(
        &self,
        src_id: i64,
        run_id: i64,
        now: chrono::DateTime<chrono::Utc>,
        fresh: Option<MatchAccepted>,
    ) -> crate::error::Result<Option<MatchAccepted>> {
        if let Some(over) = self.store.get_override(src_id)? {
            return Ok(Some(MatchAccepted {
                src_id,
                uprn: over.uprn,
                method: Method::ManualOverride,
                score: 1.0,
                confidence: Decision::AutoAccepted,
                run_id,
                accepted_by: over.actor,
                accepted_at: now,
            }));
        }

        let Some(candidate) = fresh else {
            return Ok(None);
        };

        let previous = self.store.get_accepted(src_id)?;
        match previous {
            None => Ok(Some(candidate)),
            Some(prev) => match rerun_policy(candidate.score, prev.score, None, self.config.thresholds.rerun_improvement) {
                RerunDecision::Supersede => Ok(Some(candidate)),
                RerunDecision::KeepPrevious => Ok(None),
                RerunDecision::OverrideWins { .. } => unreachable!("override already handled above"),
            },
        }
    }
}

fn dedup_by_canonical(documents: Vec<SourceDocument>) -> Vec<SourceDocument> {
    let mut seen = std::collections::HashSet::new();
    documents
        .into_iter()
        .filter(|d| seen.insert(d.canonical.clone()))
        .collect()
}

fn conservative_thresholds(base: &crate::config::ThresholdConfig) -> crate::config::ThresholdConfig {
    let mut t = base.clone();
    t.trigram_floor = base.conservative_min_trigram;
    t
}

fn passes_conservative(
    candidate: &crate::candidates::Candidate,
    thresholds: &crate::config::ThresholdConfig,
    doc_coords: (Option<f64>, Option<f64>),
) -> bool {
    if candidate.features.trigram_score < thresholds.conservative_min_trigram {
        return false;
    }
    if candidate.features.jaro_score < thresholds.conservative_min_jaro {
        return false;
    }
    if candidate.features.house_number_match != crate::domain::HouseNumberMatch::Absent
        && candidate.features.house_number_match != crate::domain::HouseNumberMatch::Exact
    {
        return false;
    }
    if candidate.features.locality_overlap < 0.5 {
        return false;
    }
    if let ((Some(de), Some(dn)), Some(ce), Some(cn)) =
        (doc_coords, candidate.easting, candidate.northing)
    {
        let distance = crate::features::bng_distance((de, dn), (ce, cn));
        if distance > thresholds.conservative_max_distance_m {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_token_starts_uncancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn dedup_by_canonical_keeps_first_occurrence() {
        let doc = |src_id, canonical: &str| SourceDocument {
            src_id,
            source_type: "test".to_string(),
            raw_address: canonical.to_string(),
            canonical: canonical.to_string(),
            postcode: None,
            raw_uprn: None,
            raw_easting: None,
            raw_northing: None,
            external_reference: None,
            doc_date: None,
        };
        let docs = vec![doc(1, "A"), doc(2, "A"), doc(3, "B")];
        let deduped = dedup_by_canonical(docs);
        assert_eq!(deduped.len(), 2);
    }

    use crate::domain::MatchOverride;
    use crate::store::{NullEmbeddingService, NullVectorStore, SqliteStore};

    fn test_pipeline<'a>(
        store: &'a SqliteStore,
        rules: &'a RuleSet,
        config: &'a Config,
    ) -> Pipeline<'a> {
        Pipeline {
            store,
            vector_store: &NullVectorStore,
            embedder: &NullEmbeddingService,
            rules,
            config,
        }
    }

    fn candidate_accepted(src_id: i64, uprn: &str, score: f64, run_id: i64) -> MatchAccepted {
        MatchAccepted {
            src_id,
            uprn: uprn.to_string(),
            method: Method::TrigramFuzzy,
            score,
            confidence: Decision::AutoAccepted,
            run_id,
            accepted_by: "pipeline".to_string(),
            accepted_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn resolve_acceptance_first_acceptance_has_no_previous() {
        let store = SqliteStore::open_in_memory().unwrap();
        let rules = RuleSet::default();
        let config = Config::default();
        let pipeline = test_pipeline(&store, &rules, &config);

        let candidate = candidate_accepted(1, "100", 0.90, 1);
        let resolved = pipeline.resolve_acceptance(1, 1, chrono::Utc::now(), Some(candidate)).unwrap();
        assert_eq!(resolved.map(|a| a.uprn), Some("100".to_string()));
    }

    #[test]
    fn resolve_acceptance_supersedes_on_sufficient_improvement() {
        let store = SqliteStore::open_in_memory().unwrap();
        let rules = RuleSet::default();
        let config = Config::default();

        let prior = candidate_accepted(1, "100", 0.87, 1);
        store.record_decision(&[], Some(&prior)).unwrap();

        let pipeline = test_pipeline(&store, &rules, &config);
        let new_candidate = candidate_accepted(1, "101", 0.90, 2);
        let resolved = pipeline.resolve_acceptance(1, 2, chrono::Utc::now(), Some(new_candidate)).unwrap();
        assert_eq!(resolved.map(|a| a.uprn), Some("101".to_string()));
    }

    #[test]
    fn resolve_acceptance_keeps_previous_without_sufficient_improvement() {
        let store = SqliteStore::open_in_memory().unwrap();
        let rules = RuleSet::default();
        let config = Config::default();

        let prior = candidate_accepted(1, "100", 0.87, 1);
        store.record_decision(&[], Some(&prior)).unwrap();

        let pipeline = test_pipeline(&store, &rules, &config);
        let new_candidate = candidate_accepted(1, "101", 0.88, 2);
        let resolved = pipeline.resolve_acceptance(1, 2, chrono::Utc::now(), Some(new_candidate)).unwrap();
        assert!(resolved.is_none());
    }

    #[test]
    fn resolve_acceptance_override_always_wins_over_fresh_acceptance() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert_override(&MatchOverride {
                src_id: 1,
                uprn: "7".to_string(),
                reason: "manual QA".to_string(),
                actor: "operator".to_string(),
                decided_at: chrono::Utc::now(),
            })
            .unwrap();
        let rules = RuleSet::default();
        let config = Config::default();
        let pipeline = test_pipeline(&store, &rules, &config);

        let new_candidate = candidate_accepted(1, "999", 0.99, 2);
        let resolved = pipeline
            .resolve_acceptance(1, 2, chrono::Utc::now(), Some(new_candidate))
            .unwrap()
            .unwrap();
        assert_eq!(resolved.uprn, "7");
        assert_eq!(resolved.method, Method::ManualOverride);
        assert_eq!(resolved.score, 1.0);
        assert_eq!(resolved.accepted_by, "operator");
    }

    /// The bug this guards against: a document whose fresh run produced
    /// needs_review/rejected (`fresh = None`) must still surface a standing
    /// override rather than silently leaving the acceptance empty.
    #[test]
    fn resolve_acceptance_override_surfaces_without_a_fresh_acceptance() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert_override(&MatchOverride {
                src_id: 1,
                uprn: "7".to_string(),
                reason: "manual QA".to_string(),
                actor: "operator".to_string(),
                decided_at: chrono::Utc::now(),
            })
            .unwrap();
        let rules = RuleSet::default();
        let config = Config::default();
        let pipeline = test_pipeline(&store, &rules, &config);

        let resolved = pipeline.resolve_acceptance(1, 2, chrono::Utc::now(), None).unwrap().unwrap();
        assert_eq!(resolved.uprn, "7");
        assert_eq!(resolved.method, Method::ManualOverride);
    }

    #[test]
    fn resolve_acceptance_without_override_or_fresh_acceptance_is_none() {
        let store = SqliteStore::open_in_memory().unwrap();
        let rules = RuleSet::default();
        let config = Config::default();
        let pipeline = test_pipeline(&store, &rules, &config);

        let resolved = pipeline.resolve_acceptance(1, 2, chrono::Utc::now(), None).unwrap();
        assert!(resolved.is_none());
    }
}
