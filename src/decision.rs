//! Decision Engine — spec.md §4.5.
//!
//! Pure state machine over an already-scored, already-sorted candidate list.
//! Nothing here touches the store directly; `Outcome` carries everything the
//! pipeline driver needs to build `MatchResult`/`MatchAccepted` rows.

use chrono::{DateTime, Utc};

use crate::candidates::Candidate;
use crate::config::ThresholdConfig;
use crate::domain::{Decision, FeatureMap, HouseNumberMatch, Method};

#[derive(Debug, Clone)]
pub struct ScoredResult {
    pub uprn: String,
    pub method: Method,
    pub score: f64,
    pub tie_rank: u32,
    pub features: FeatureMap,
}

#[derive(Debug, Clone)]
pub struct Outcome {
    pub decision: Decision,
    /// One row per evaluated candidate kept for audit (up to three for
    /// needs_review, one for auto_accepted/rejected-with-a-best-guess).
    pub results: Vec<ScoredResult>,
    /// Set only when `decision == AutoAccepted`.
    pub accepted_uprn: Option<String>,
    pub accepted_method: Option<Method>,
    pub accepted_score: Option<f64>,
}

/// Decides the outcome for one document's already-merged candidate list,
/// already sorted by `final_score` descending (the generator's contract).
pub fn decide(candidates: &[Candidate], thresholds: &ThresholdConfig) -> Outcome {
    if candidates.is_empty() {
        return Outcome {
            decision: Decision::Rejected,
            results: Vec::new(),
            accepted_uprn: None,
            accepted_method: None,
            accepted_score: None,
        };
    }

    let best = &candidates[0];
    let second = candidates.get(1);
    let margin = second.map(|s| best.final_score - s.final_score).unwrap_or(f64::MAX);

    if best.final_score >= thresholds.auto_accept_high
        && (second.is_none() || margin >= thresholds.winner_margin)
    {
        return accept(best, candidates);
    }

    let locality_ok = best.features.locality_overlap >= 0.5;
    if best.final_score >= thresholds.auto_accept_medium
        && best.features.house_number_match == HouseNumberMatch::Exact
        && locality_ok
        && margin >= thresholds.winner_margin
    {
        return accept(best, candidates);
    }

    if best.final_score >= thresholds.needs_review {
        let results = candidates
            .iter()
            .take(3)
            .enumerate()
            .map(|(i, c)| ScoredResult {
                uprn: c.uprn.clone(),
                method: c.method,
                score: c.final_score,
                tie_rank: (i + 1) as u32,
                features: c.features.to_feature_map(),
            })
            .collect();
        return Outcome {
            decision: Decision::NeedsReview,
            results,
            accepted_uprn: None,
            accepted_method: None,
            accepted_score: None,
        };
    }

    Outcome {
        decision: Decision::Rejected,
        results: vec![ScoredResult {
            uprn: best.uprn.clone(),
            method: best.method,
            score: best.final_score,
            tie_rank: 1,
            features: best.features.to_feature_map(),
        }],
        accepted_uprn: None,
        accepted_method: None,
        accepted_score: None,
    }
}

fn accept(best: &Candidate, candidates: &[Candidate]) -> Outcome {
    let results = candidates
        .iter()
        .take(3)
        .enumerate()
        .map(|(i, c)| ScoredResult {
            uprn: c.uprn.clone(),
            method: c.method,
            score: c.final_score,
            tie_rank: (i + 1) as u32,
            features: c.features.to_feature_map(),
        })
        .collect();
    Outcome {
        decision: Decision::AutoAccepted,
        results,
        accepted_uprn: Some(best.uprn.clone()),
        accepted_method: Some(best.method),
        accepted_score: Some(best.final_score),
    }
}

/// Re-run policy for a document that already has an acceptance from an
/// older run — spec.md §4.5 "Re-run policy". Overrides always win and are
/// reported back with `method = manual_override`, `score = 1.0`.
pub enum RerunDecision {
    /// An override exists; short-circuit with this uprn regardless of the
    /// new run's outcome.
    OverrideWins { uprn: String },
    /// The new acceptance supersedes the prior one.
    Supersede,
    /// The prior acceptance stands; the new outcome is recorded for audit
    /// only, not promoted to `MatchAccepted`.
    KeepPrevious,
}

pub fn rerun_policy(
    new_score: f64,
    previous_score: f64,
    override_uprn: Option<&str>,
    rerun_improvement: f64,
) -> RerunDecision {
    if let Some(uprn) = override_uprn {
        return RerunDecision::OverrideWins { uprn: uprn.to_string() };
    }
    if new_score - previous_score >= rerun_improvement {
        RerunDecision::Supersede
    } else {
        RerunDecision::KeepPrevious
    }
}

pub fn decided_at() -> DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Status;
    use crate::features::Features;

    fn candidate(uprn: &str, score: f64, house_number_match: HouseNumberMatch, locality_overlap: f64) -> Candidate {
        Candidate {
            uprn: uprn.to_string(),
            full_address: "X".to_string(),
            canonical: "X".to_string(),
            postcode: None,
            status: Status::Live,
            blpu_class: None,
            easting: None,
            northing: None,
            features: Features {
                trigram_score: score,
                jaro_score: score,
                levenshtein_norm: score,
                token_overlap: score,
                locality_overlap,
                street_overlap: score,
                house_number_match,
                alpha_suffix_match: false,
                phonetic_hits: 1,
                phonetic_total: 1,
                cosine_semantic: None,
                spatial_boost: 0.0,
                descriptor_mismatch: false,
                status: Status::Live,
                valid_uprn: false,
            },
            final_score: score,
            tier: crate::domain::Tier::B,
            method: Method::TrigramFuzzy,
            alternative_methods: Vec::new(),
        }
    }

    fn thresholds() -> ThresholdConfig {
        ThresholdConfig::default()
    }

    #[test]
    fn empty_candidates_is_rejected() {
        let outcome = decide(&[], &thresholds());
        assert_eq!(outcome.decision, Decision::Rejected);
        assert!(outcome.accepted_uprn.is_none());
    }

    #[test]
    fn single_high_score_auto_accepts() {
        let candidates = vec![candidate("1", 0.95, HouseNumberMatch::Exact, 1.0)];
        let outcome = decide(&candidates, &thresholds());
        assert_eq!(outcome.decision, Decision::AutoAccepted);
        assert_eq!(outcome.accepted_uprn.as_deref(), Some("1"));
    }

    #[test]
    fn high_score_without_winner_margin_falls_to_review() {
        let candidates = vec![
            candidate("1", 0.95, HouseNumberMatch::Exact, 1.0),
            candidate("2", 0.94, HouseNumberMatch::Exact, 1.0),
        ];
        let outcome = decide(&candidates, &thresholds());
        assert_eq!(outcome.decision, Decision::NeedsReview);
    }

    #[test]
    fn medium_score_requires_exact_house_number_and_locality() {
        let candidates = vec![
            candidate("1", 0.89, HouseNumberMatch::Exact, 0.6),
            candidate("2", 0.70, HouseNumberMatch::Absent, 0.0),
        ];
        let outcome = decide(&candidates, &thresholds());
        assert_eq!(outcome.decision, Decision::AutoAccepted);
    }

    #[test]
    fn house_number_conflict_never_auto_accepts() {
        let candidates = vec![candidate("1", 0.95, HouseNumberMatch::Conflict, 1.0)];
        let outcome = decide(&candidates, &thresholds());
        assert_ne!(outcome.decision, Decision::AutoAccepted);
    }

    #[test]
    fn needs_review_persists_up_to_three_tie_ranks() {
        let candidates = vec![
            candidate("1", 0.82, HouseNumberMatch::Absent, 0.0),
            candidate("2", 0.81, HouseNumberMatch::Absent, 0.0),
            candidate("3", 0.80, HouseNumberMatch::Absent, 0.0),
            candidate("4", 0.79, HouseNumberMatch::Absent, 0.0),
        ];
        let outcome = decide(&candidates, &thresholds());
        assert_eq!(outcome.decision, Decision::NeedsReview);
        assert_eq!(outcome.results.len(), 3);
        assert_eq!(outcome.results[0].tie_rank, 1);
    }

    #[test]
    fn below_min_threshold_is_rejected() {
        let candidates = vec![candidate("1", 0.5, HouseNumberMatch::Absent, 0.0)];
        let outcome = decide(&candidates, &thresholds());
        assert_eq!(outcome.decision, Decision::Rejected);
    }

    #[test]
    fn rerun_policy_override_always_wins() {
        let decision = rerun_policy(0.99, 0.50, Some("7"), 0.02);
        assert!(matches!(decision, RerunDecision::OverrideWins { uprn } if uprn == "7"));
    }

    #[test]
    fn rerun_policy_supersedes_on_sufficient_improvement() {
        let decision = rerun_policy(0.90, 0.87, None, 0.02);
        assert!(matches!(decision, RerunDecision::Supersede));
    }

    #[test]
    fn rerun_policy_keeps_previous_on_marginal_improvement() {
        let decision = rerun_policy(0.88, 0.87, None, 0.02);
        assert!(matches!(decision, RerunDecision::KeepPrevious));
    }

    // spec.md §8 end-to-end scenario 3: a misspelt fuzzy match (12A, trigram
    // ~0.92) beats a house-number-close alternative (12, trigram ~0.88) by
    // more than the winner margin.
    #[test]
    fn literal_scenario_fuzzy_winner_margin() {
        let winner = candidate("12A", 0.95, HouseNumberMatch::Exact, 1.0);
        let runner_up = candidate("12", 0.85, HouseNumberMatch::Close, 1.0);
        let outcome = decide(&[winner, runner_up], &thresholds());
        assert_eq!(outcome.decision, Decision::AutoAccepted);
        assert_eq!(outcome.accepted_uprn.as_deref(), Some("12A"));
    }

    // spec.md §8 end-to-end scenario 5: two equally-scored "ROSE COTTAGE"
    // entries tie below the winner margin — needs_review with two tie-ranked
    // results and no acceptance.
    #[test]
    fn literal_scenario_needs_review_on_tie() {
        let a = candidate("rose-cottage-1", 0.92, HouseNumberMatch::Absent, 1.0);
        let b = candidate("rose-cottage-2", 0.92, HouseNumberMatch::Absent, 1.0);
        let outcome = decide(&[a, b], &thresholds());
        assert_eq!(outcome.decision, Decision::NeedsReview);
        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.results[0].tie_rank, 1);
        assert_eq!(outcome.results[1].tie_rank, 2);
        assert!(outcome.accepted_uprn.is_none());
    }

    // spec.md §8 end-to-end scenario 6: two candidates tie at 0.88 before
    // spatial refinement; the nearer one (18m vs 180m, 100m decay) pulls
    // ahead by more than the winner margin and auto-accepts.
    #[test]
    fn literal_scenario_spatial_refinement_promotes_close_candidate() {
        use crate::config::WeightConfig;

        let weights = WeightConfig::default();
        let pre_spatial = |trigram: f64| Features {
            trigram_score: trigram,
            jaro_score: trigram,
            levenshtein_norm: trigram,
            token_overlap: trigram,
            locality_overlap: 1.0,
            street_overlap: 1.0,
            house_number_match: HouseNumberMatch::Exact,
            alpha_suffix_match: false,
            phonetic_hits: 1,
            phonetic_total: 1,
            cosine_semantic: None,
            spatial_boost: 0.0,
            descriptor_mismatch: false,
            status: Status::Live,
            valid_uprn: false,
        };

        // Solved so that score(spatial_boost=0) == 0.88 exactly, matching
        // the spec's literal "tie at 0.88" premise.
        let mut near = pre_spatial(0.8125);
        near.spatial_boost = crate::features::spatial_boost(18.0, 100.0);
        let near_score = near.score(&weights);

        let mut far = pre_spatial(0.8125);
        far.spatial_boost = crate::features::spatial_boost(180.0, 100.0);
        let far_score = far.score(&weights);

        assert!(near_score > far_score);
        assert!(near_score - far_score >= thresholds().winner_margin);

        let mut a = candidate("near", near_score, HouseNumberMatch::Exact, 1.0);
        a.features = near;
        a.final_score = near_score;
        let mut b = candidate("far", far_score, HouseNumberMatch::Exact, 1.0);
        b.features = far;
        b.final_score = far_score;

        let outcome = decide(&[a, b], &thresholds());
        assert_eq!(outcome.decision, Decision::AutoAccepted);
        assert_eq!(outcome.accepted_uprn.as_deref(), Some("near"));
    }
}
