//! Core data model — spec.md §3.
//!
//! Plain value types shared by every layer of the pipeline. Nothing here
//! talks to a store; persistence mapping lives in `store`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Gazetteer (LLPG) entry lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Live,
    Provisional,
    Historic,
}

impl Status {
    /// Ranking used to break ties in tier A.2 (§4.3): live > provisional > historic.
    pub fn rank(self) -> u8 {
        match self {
            Status::Live => 2,
            Status::Provisional => 1,
            Status::Historic => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Live => "live",
            Status::Provisional => "provisional",
            Status::Historic => "historic",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "live" => Some(Status::Live),
            "provisional" => Some(Status::Provisional),
            "historic" => Some(Status::Historic),
            _ => None,
        }
    }
}

/// A gazetteer (LLPG) entry — spec.md §3 "Address".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub uprn: String,
    pub full_address: String,
    pub canonical: String,
    pub postcode: Option<String>,
    pub usrn: Option<String>,
    pub blpu_class: Option<String>,
    pub status: Status,
    pub easting: Option<f64>,
    pub northing: Option<f64>,
}

impl Address {
    /// Residential BLPU classes start with `R` per the standard UK BLPU
    /// classification scheme (e.g. `RD`, `RD04`); used as the §4.3 A.2
    /// secondary tie-break key.
    pub fn is_residential(&self) -> bool {
        self.blpu_class
            .as_deref()
            .map(|c| c.starts_with('R') || c.starts_with('r'))
            .unwrap_or(false)
    }

    /// True when this row may appear in fuzzy/semantic candidate pools.
    pub fn fuzzy_eligible(&self) -> bool {
        matches!(self.status, Status::Live | Status::Provisional)
    }
}

/// An incoming municipal document — spec.md §3 "SourceDocument".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub src_id: i64,
    pub source_type: String,
    pub raw_address: String,
    pub canonical: String,
    pub postcode: Option<String>,
    pub raw_uprn: Option<String>,
    pub raw_easting: Option<f64>,
    pub raw_northing: Option<f64>,
    pub external_reference: Option<String>,
    pub doc_date: Option<chrono::NaiveDate>,
}

/// Candidate-generation tier that produced a candidate — spec.md §2/§4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    A,
    B,
    C,
    D,
}

/// Method string recorded for explainability — spec.md §3 "Candidate".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    ValidUprn,
    ExactCanonical,
    TrigramFuzzy,
    VectorSemantic,
    SpatialSearch,
    ManualOverride,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::ValidUprn => "valid_uprn",
            Method::ExactCanonical => "exact_canonical",
            Method::TrigramFuzzy => "trigram_fuzzy",
            Method::VectorSemantic => "vector_semantic",
            Method::SpatialSearch => "spatial_search",
            Method::ManualOverride => "manual_override",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// House-number comparison outcome — spec.md §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum HouseNumberMatch {
    Conflict,
    Absent,
    Close,
    Exact,
}

impl HouseNumberMatch {
    pub fn value(self) -> f64 {
        match self {
            HouseNumberMatch::Conflict => -1.0,
            HouseNumberMatch::Absent => 0.0,
            HouseNumberMatch::Close => 0.5,
            HouseNumberMatch::Exact => 1.0,
        }
    }
}

/// Final decision for a document — spec.md §4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    AutoAccepted,
    NeedsReview,
    Rejected,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::AutoAccepted => "auto_accepted",
            Decision::NeedsReview => "needs_review",
            Decision::Rejected => "rejected",
        }
    }
}

/// Run-level metadata — spec.md §3 "MatchRun".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRun {
    pub run_id: i64,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub label: String,
    pub processed: u64,
    pub accepted: u64,
    pub review: u64,
    pub rejected: u64,
    pub errored: u64,
}

impl MatchRun {
    pub fn new(run_id: i64, label: impl Into<String>, started_at: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            run_id,
            started_at,
            completed_at: None,
            label: label.into(),
            processed: 0,
            accepted: 0,
            review: 0,
            rejected: 0,
            errored: 0,
        }
    }
}

/// One opaque scalar inside a persisted feature map — §9 REDESIGN FLAGS
/// ("dynamic `map[string]interface{}` feature bags"). Scoring never reads
/// this form; it exists only at the persistence boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Num(f64),
    Int(i64),
    Bool(bool),
    Str(String),
}

pub type FeatureMap = BTreeMap<String, FeatureValue>;

/// A persisted candidate evaluation — spec.md §3 "MatchResult".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub match_id: Option<i64>,
    pub run_id: i64,
    pub src_id: i64,
    pub candidate_uprn: String,
    pub method: Method,
    pub score: f64,
    pub confidence: Decision,
    pub tie_rank: u32,
    pub features: FeatureMap,
    pub decision: Decision,
    pub decided_by: String,
    pub decided_at: chrono::DateTime<chrono::Utc>,
    pub notes: Option<String>,
}

/// The single accepted match for a document — spec.md §3 "MatchAccepted".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchAccepted {
    pub src_id: i64,
    pub uprn: String,
    pub method: Method,
    pub score: f64,
    pub confidence: Decision,
    pub run_id: i64,
    pub accepted_by: String,
    pub accepted_at: chrono::DateTime<chrono::Utc>,
}

/// A manual override — spec.md §3 "MatchOverride". Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchOverride {
    pub src_id: i64,
    pub uprn: String,
    pub reason: String,
    pub actor: String,
    pub decided_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_rank_orders_live_over_historic() {
        assert!(Status::Live.rank() > Status::Provisional.rank());
        assert!(Status::Provisional.rank() > Status::Historic.rank());
    }

    #[test]
    fn historic_is_not_fuzzy_eligible() {
        let addr = Address {
            uprn: "1".into(),
            full_address: "X".into(),
            canonical: "X".into(),
            postcode: None,
            usrn: None,
            blpu_class: None,
            status: Status::Historic,
            easting: None,
            northing: None,
        };
        assert!(!addr.fuzzy_eligible());
    }

    #[test]
    fn house_number_match_values_match_spec() {
        assert_eq!(HouseNumberMatch::Conflict.value(), -1.0);
        assert_eq!(HouseNumberMatch::Absent.value(), 0.0);
        assert_eq!(HouseNumberMatch::Close.value(), 0.5);
        assert_eq!(HouseNumberMatch::Exact.value(), 1.0);
    }

    #[test]
    fn method_strings_match_spec_literals() {
        assert_eq!(Method::ValidUprn.as_str(), "valid_uprn");
        assert_eq!(Method::ExactCanonical.as_str(), "exact_canonical");
        assert_eq!(Method::VectorSemantic.as_str(), "vector_semantic");
        assert_eq!(Method::SpatialSearch.as_str(), "spatial_search");
        assert_eq!(Method::ManualOverride.as_str(), "manual_override");
    }
}
