//! Candidate generation — spec.md §4.3.
//!
//! Runs tiers A-D in order, short-circuiting after tier A produces a result.
//! Each tier's own filter/threshold logic lives in its `tier_*` method;
//! `generate` owns only sequencing and the final merge/dedup.

use std::collections::HashMap;

use crate::config::{CollaboratorConfig, ThresholdConfig, WeightConfig};
use crate::domain::{Address, HouseNumberMatch, Method, SourceDocument, Status, Tier};
use crate::error::Result;
use crate::features::{self, Features};
use crate::normalise::{Normalised, Normaliser};
use crate::rules::RuleSet;
use crate::store::{EmbeddingService, RelationalStore, VectorStore};

#[derive(Debug, Clone)]
pub struct Candidate {
    pub uprn: String,
    pub full_address: String,
    pub canonical: String,
    pub postcode: Option<String>,
    pub status: Status,
    pub blpu_class: Option<String>,
    pub easting: Option<f64>,
    pub northing: Option<f64>,
    pub features: Features,
    pub final_score: f64,
    pub tier: Tier,
    pub method: Method,
    /// Other tiers/methods that also surfaced this uprn, kept for audit —
    /// spec.md §4.3 "Merge".
    pub alternative_methods: Vec<Method>,
}

impl Candidate {
    fn from_address(addr: Address, tier: Tier, method: Method, features: Features, score: f64) -> Self {
        Self {
            uprn: addr.uprn,
            full_address: addr.full_address,
            canonical: addr.canonical,
            postcode: addr.postcode,
            status: addr.status,
            blpu_class: addr.blpu_class,
            easting: addr.easting,
            northing: addr.northing,
            features,
            final_score: score,
            tier,
            method,
            alternative_methods: Vec::new(),
        }
    }
}

pub struct CandidateGenerator<'a> {
    pub store: &'a dyn RelationalStore,
    pub vector_store: &'a dyn VectorStore,
    pub embedder: &'a dyn EmbeddingService,
    pub rules: &'a RuleSet,
    pub thresholds: &'a ThresholdConfig,
    pub weights: &'a WeightConfig,
    pub collaborators: &'a CollaboratorConfig,
}

impl<'a> CandidateGenerator<'a> {
    /// Runs tier A, then (unless `tier_a_only`) B/C/D. The pipeline driver's
    /// deterministic layer (spec.md §4.6 Layer 2) sets `tier_a_only` so it
    /// only ever resolves what tier A resolves, carrying everything else
    /// forward to the fuzzy layers untouched.
    pub fn generate(&self, doc: &SourceDocument, tier_a_only: bool) -> Result<Vec<Candidate>> {
        let normaliser = Normaliser::new(self.rules);
        let doc_norm = normaliser.normalise(&doc.raw_address)?;

        if let Some(candidates) = self.tier_a(doc, &doc_norm, &normaliser)? {
            return Ok(candidates);
        }
        if tier_a_only {
            return Ok(Vec::new());
        }

        let mut candidates = self.tier_b(doc, &doc_norm, &normaliser)?;
        candidates.extend(self.tier_c(doc, &normaliser)?);
        self.tier_d(doc, &mut candidates);

        Ok(merge_dedup(candidates))
    }

    /// A.1/A.2 — deterministic lookup. `Some` short-circuits the generator.
    fn tier_a(
        &self,
        doc: &SourceDocument,
        doc_norm: &Normalised,
        normaliser: &Normaliser,
    ) -> Result<Option<Vec<Candidate>>> {
        if let Some(raw) = &doc.raw_uprn {
            if let Some(cleaned) = clean_uprn(raw) {
                if let Some(addr) = self.store.find_by_uprn(&cleaned)? {
                    let features = self.annotate(doc, doc_norm, &addr, None, true, normaliser);
                    return Ok(Some(vec![Candidate::from_address(
                        addr,
                        Tier::A,
                        Method::ValidUprn,
                        features,
                        1.0,
                    )]));
                }
            }
        }

        let mut rows = self.store.find_by_canonical(&doc.canonical)?;
        if rows.is_empty() {
            return Ok(None);
        }
        rows.sort_by(|a, b| {
            b.status
                .rank()
                .cmp(&a.status.rank())
                .then_with(|| b.is_residential().cmp(&a.is_residential()))
        });
        let candidates = rows
            .into_iter()
            .map(|addr| {
                let features = self.annotate(doc, doc_norm, &addr, None, false, normaliser);
                Candidate::from_address(addr, Tier::A, Method::ExactCanonical, features, 0.99)
            })
            .collect();
        Ok(Some(candidates))
    }

    /// B.1-B.3 — trigram retrieval, annotation, filter chain.
    fn tier_b(
        &self,
        doc: &SourceDocument,
        doc_norm: &Normalised,
        normaliser: &Normaliser,
    ) -> Result<Vec<Candidate>> {
        if doc.canonical.chars().count() < 5 {
            return Ok(Vec::new());
        }
        let hits = self.store.trigram_search(
            &doc.canonical,
            self.thresholds.trigram_floor,
            self.thresholds.trigram_limit,
            &[Status::Live, Status::Provisional],
        )?;

        let mut out = Vec::new();
        for (addr, trigram_score) in hits {
            let features = self.annotate(doc, doc_norm, &addr, Some(trigram_score), false, normaliser);
            if self.filtered_by_tier_b(&features) {
                continue;
            }
            let score = features.score(self.weights);
            out.push(Candidate::from_address(addr, Tier::B, Method::TrigramFuzzy, features, score));
        }
        Ok(out)
    }

    fn filtered_by_tier_b(&self, features: &Features) -> bool {
        if features.trigram_score < self.thresholds.trigram_floor {
            return true;
        }
        if features.trigram_score < self.thresholds.trigram_phonetic_floor && features.phonetic_hits == 0 {
            return true;
        }
        if features.house_number_match == HouseNumberMatch::Conflict {
            return true;
        }
        let preview = features.score(self.weights);
        preview < self.thresholds.min_threshold
    }

    /// Tier C — semantic vector neighbours, optional collaborator.
    fn tier_c(&self, doc: &SourceDocument, normaliser: &Normaliser) -> Result<Vec<Candidate>> {
        if !self.collaborators.vector_store_enabled || doc.canonical.chars().count() < 10 {
            return Ok(Vec::new());
        }
        let vector = match self.embedder.embed(&doc.canonical) {
            Ok(v) => v,
            Err(_) => return Ok(Vec::new()), // §7: Tier C degrades, never aborts.
        };
        let hits = match self
            .vector_store
            .search("addresses", &vector, self.thresholds.vector_top_k)
        {
            Ok(h) => h,
            Err(_) => return Ok(Vec::new()),
        };

        let doc_norm = normaliser.normalise(&doc.raw_address)?;
        let mut out = Vec::new();
        for hit in hits {
            if hit.score < self.thresholds.vector_min_cosine {
                continue;
            }
            if let Some(addr) = self.store.find_by_uprn(&hit.id)? {
                let mut features = self.annotate(doc, &doc_norm, &addr, None, false, normaliser);
                features.cosine_semantic = Some(hit.score);
                let score = features.score(self.weights);
                out.push(Candidate::from_address(addr, Tier::C, Method::VectorSemantic, features, score));
            }
        }
        Ok(out)
    }

    /// Tier D — spatial boost on existing candidates, optional radius expansion.
    fn tier_d(&self, doc: &SourceDocument, candidates: &mut Vec<Candidate>) {
        let (easting, northing) = match (doc.raw_easting, doc.raw_northing) {
            (Some(e), Some(n)) => (e, n),
            _ => return,
        };

        for candidate in candidates.iter_mut() {
            if let (Some(e), Some(n)) = (candidate.easting, candidate.northing) {
                let distance = features::bng_distance((easting, northing), (e, n));
                candidate.features.spatial_boost =
                    features::spatial_boost(distance, self.thresholds.spatial_decay_m);
                candidate.final_score = candidate.features.score(self.weights);
            }
        }

        let existing: std::collections::HashSet<String> =
            candidates.iter().map(|c| c.uprn.clone()).collect();
        let expansion = self
            .store
            .spatial_within(
                easting,
                northing,
                self.thresholds.spatial_radius_m,
                &[Status::Live, Status::Provisional],
                50,
            )
            .unwrap_or_default();

        for (addr, distance) in expansion {
            if existing.contains(&addr.uprn) {
                continue;
            }
            let normaliser = Normaliser::new(self.rules);
            let doc_norm = match normaliser.normalise(&doc.raw_address) {
                Ok(n) => n,
                Err(_) => continue,
            };
            let mut features = self.annotate(doc, &doc_norm, &addr, None, false, &normaliser);
            features.spatial_boost = features::spatial_boost(distance, self.thresholds.spatial_decay_m);
            let score = features.score(self.weights);
            candidates.push(Candidate::from_address(addr, Tier::D, Method::SpatialSearch, features, score));
        }
    }

    fn annotate(
        &self,
        doc: &SourceDocument,
        doc_norm: &Normalised,
        addr: &Address,
        trigram_score: Option<f64>,
        valid_uprn: bool,
        normaliser: &Normaliser,
    ) -> Features {
        let addr_norm = normaliser.normalise(&addr.full_address).unwrap_or_else(|_| Normalised {
            canonical: addr.canonical.clone(),
            postcode: addr.postcode.clone(),
            tokens: addr.canonical.split_whitespace().map(|s| s.to_string()).collect(),
            house_number: None,
            locality_tokens: Vec::new(),
            street_tokens: Vec::new(),
            phonetic_codes: Vec::new(),
        });

        let trigram_score =
            trigram_score.unwrap_or_else(|| features::trigram_similarity(&doc.canonical, &addr.canonical));
        let jaro_score = features::jaro_similarity(&doc.canonical, &addr.canonical);
        let levenshtein_norm = crate::similarity::levenshtein_norm(&doc.canonical, &addr.canonical);
        let token_overlap = crate::similarity::token_overlap(&doc_norm.tokens, &addr_norm.tokens);

        let locality_overlap = overlap_ratio(&doc_norm.locality_tokens, &addr_norm.locality_tokens);
        let street_overlap = overlap_ratio(&doc_norm.street_tokens, &addr_norm.street_tokens);

        let house_number_match =
            features::compare_house_numbers(doc_norm.house_number.as_deref(), addr_norm.house_number.as_deref());
        let alpha_suffix_match =
            features::alpha_suffix_match(doc_norm.house_number.as_deref(), addr_norm.house_number.as_deref());

        let phonetic_hits = crate::phonetic::overlap(&doc_norm.phonetic_codes, &addr_norm.phonetic_codes);
        let phonetic_total = doc_norm.phonetic_codes.len();

        let descriptor_mismatch = doc_descriptor_tokens(doc_norm, self.rules) != doc_descriptor_tokens(&addr_norm, self.rules);

        Features {
            trigram_score,
            jaro_score,
            levenshtein_norm,
            token_overlap,
            locality_overlap,
            street_overlap,
            house_number_match,
            alpha_suffix_match,
            phonetic_hits,
            phonetic_total,
            cosine_semantic: None,
            spatial_boost: 0.0,
            descriptor_mismatch,
            status: addr.status,
            valid_uprn,
        }
    }
}

fn overlap_ratio(doc_tokens: &[String], candidate_tokens: &[String]) -> f64 {
    if doc_tokens.is_empty() {
        return 0.0;
    }
    let candidate_set: std::collections::HashSet<&str> =
        candidate_tokens.iter().map(|s| s.as_str()).collect();
    let shared = doc_tokens.iter().filter(|t| candidate_set.contains(t.as_str())).count();
    shared as f64 / doc_tokens.len() as f64
}

fn doc_descriptor_tokens(norm: &Normalised, rules: &RuleSet) -> Vec<String> {
    norm.tokens
        .iter()
        .filter(|t| rules.is_preserved_descriptor(t))
        .cloned()
        .collect()
}

/// Strip whitespace, decimal suffixes, quoting, and non-digits; reject
/// lengths beyond twelve digits — spec.md §4.3 A.1.
fn clean_uprn(raw: &str) -> Option<String> {
    let mut cleaned: String = raw
        .trim()
        .trim_end_matches(".0")
        .trim_end_matches(".00")
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect();
    cleaned = cleaned.trim_start_matches('0').to_string();
    if cleaned.is_empty() || cleaned.len() > 12 {
        return None;
    }
    Some(cleaned)
}

/// Deduplicate by uprn, keeping the candidate with the highest `final_score`
/// and recording the rest as alternative methods — spec.md §4.3 "Merge".
fn merge_dedup(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut by_uprn: HashMap<String, Candidate> = HashMap::new();
    for candidate in candidates {
        match by_uprn.get_mut(&candidate.uprn) {
            Some(existing) => {
                existing.alternative_methods.push(candidate.method);
                if candidate.final_score > existing.final_score {
                    let mut alt = existing.alternative_methods.clone();
                    alt.push(existing.method);
                    let mut winner = candidate;
                    winner.alternative_methods = alt;
                    *existing = winner;
                }
            }
            None => {
                by_uprn.insert(candidate.uprn.clone(), candidate);
            }
        }
    }
    let mut out: Vec<Candidate> = by_uprn.into_values().collect();
    out.sort_by(|a, b| b.final_score.partial_cmp(&a.final_score).unwrap_or(std::cmp::Ordering::Equal));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_uprn_strips_decimal_suffix_and_quoting() {
        assert_eq!(clean_uprn("\"100023405.0\""), Some("100023405".to_string()));
    }

    #[test]
    fn clean_uprn_rejects_too_long() {
        assert_eq!(clean_uprn("1234567890123"), None);
    }

    #[test]
    fn clean_uprn_rejects_empty() {
        assert_eq!(clean_uprn("   "), None);
    }

    #[test]
    fn merge_dedup_keeps_highest_score_and_records_alternatives() {
        let low = Candidate {
            uprn: "1".to_string(),
            full_address: "A".to_string(),
            canonical: "A".to_string(),
            postcode: None,
            status: Status::Live,
            blpu_class: None,
            easting: None,
            northing: None,
            features: sample_features(),
            final_score: 0.7,
            tier: Tier::B,
            method: Method::TrigramFuzzy,
            alternative_methods: Vec::new(),
        };
        let mut high = low.clone();
        high.final_score = 0.9;
        high.tier = Tier::D;
        high.method = Method::SpatialSearch;

        let merged = merge_dedup(vec![low, high]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].final_score, 0.9);
        assert!(merged[0].alternative_methods.contains(&Method::TrigramFuzzy));
    }

    fn sample_features() -> Features {
        Features {
            trigram_score: 0.5,
            jaro_score: 0.5,
            levenshtein_norm: 0.5,
            token_overlap: 0.5,
            locality_overlap: 0.5,
            street_overlap: 0.5,
            house_number_match: HouseNumberMatch::Absent,
            alpha_suffix_match: false,
            phonetic_hits: 0,
            phonetic_total: 0,
            cosine_semantic: None,
            spatial_boost: 0.0,
            descriptor_mismatch: false,
            status: Status::Live,
            valid_uprn: false,
        }
    }
}
