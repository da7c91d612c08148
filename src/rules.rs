//! Immutable rule tables consumed by the normaliser — spec.md §4.1, §9.
//!
//! §9 flags the source's global mutable regex/locality tables for
//! re-architecture: here they live on one `RuleSet` value, built once per run
//! (`RuleSet::default()` or `RuleSet::load_from_store`) and passed by
//! reference through the pipeline. `version` is recorded on the `MatchRun`
//! row so a replay can reconstruct the exact rule set that scored a result.

use std::collections::{HashMap, HashSet};

/// Priority-ordered abbreviation expansion rule. Higher `priority` runs first.
#[derive(Debug, Clone, PartialEq)]
pub struct AbbreviationRule {
    pub pattern: &'static str,
    pub replacement: &'static str,
    pub priority: i32,
}

#[derive(Debug, Clone)]
pub struct RuleSet {
    pub version: u32,
    abbreviations: Vec<AbbreviationRule>,
    localities: HashSet<String>,
    multi_word_localities: Vec<Vec<String>>,
    stoplist: HashSet<String>,
    descriptors_preserved: HashSet<String>,
    descriptors_stripped: HashSet<String>,
    /// Hand-crafted rewrite table consulted before candidate generation
    /// (§9 open question: e.g. `LUCKY LITE FARM` -> `LUCKYLITE FARM`).
    rewrites: HashMap<String, String>,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            version: 1,
            abbreviations: default_abbreviations(),
            localities: default_localities(),
            multi_word_localities: default_multi_word_localities(),
            stoplist: default_stoplist(),
            descriptors_preserved: default_descriptors_preserved(),
            descriptors_stripped: default_descriptors_stripped(),
            rewrites: default_rewrites(),
        }
    }
}

impl RuleSet {
    /// Abbreviation rules, highest priority first, ready for word-boundary
    /// substitution.
    pub fn abbreviations(&self) -> &[AbbreviationRule] {
        &self.abbreviations
    }

    pub fn is_locality(&self, token: &str) -> bool {
        self.localities.contains(token)
    }

    /// Multi-word locality phrases, longest-first, matched before
    /// single-word tokenisation (spec.md §4.1 step 8).
    pub fn multi_word_localities(&self) -> &[Vec<String>] {
        &self.multi_word_localities
    }

    pub fn is_stopword(&self, token: &str) -> bool {
        self.stoplist.contains(token) || token.chars().count() < 2
    }

    pub fn is_preserved_descriptor(&self, token: &str) -> bool {
        self.descriptors_preserved.contains(token)
    }

    pub fn is_stripped_descriptor(&self, token: &str) -> bool {
        self.descriptors_stripped.contains(token)
    }

    /// Apply the configured rewrite table to a fully-expanded canonical
    /// string. Longest match key wins when multiple keys are substrings.
    pub fn apply_rewrites(&self, canonical: &str) -> String {
        let mut result = canonical.to_string();
        let mut keys: Vec<&String> = self.rewrites.keys().collect();
        keys.sort_by_key(|k| std::cmp::Reverse(k.len()));
        for key in keys {
            if result.contains(key.as_str()) {
                result = result.replace(key.as_str(), &self.rewrites[key]);
            }
        }
        result
    }

    pub fn insert_rewrite(&mut self, from: impl Into<String>, to: impl Into<String>) {
        self.rewrites.insert(from.into(), to.into());
    }

    pub fn insert_locality(&mut self, locality: impl Into<String>) {
        let locality = locality.into();
        if locality.contains(' ') {
            self.multi_word_localities
                .push(locality.split_whitespace().map(|s| s.to_string()).collect());
        } else {
            self.localities.insert(locality);
        }
    }
}

fn rule(pattern: &'static str, replacement: &'static str, priority: i32) -> AbbreviationRule {
    AbbreviationRule {
        pattern,
        replacement,
        priority,
    }
}

/// ≥60 word-boundary abbreviation rules across street/building/area/direction/
/// business/regional categories — spec.md §4.1 step 4.
fn default_abbreviations() -> Vec<AbbreviationRule> {
    let mut rules = vec![
        // Street types
        rule("RD", "ROAD", 100),
        rule("ST", "STREET", 100),
        rule("AVE", "AVENUE", 100),
        rule("GDNS", "GARDENS", 100),
        rule("CT", "COURT", 100),
        rule("DR", "DRIVE", 100),
        rule("LN", "LANE", 100),
        rule("PL", "PLACE", 100),
        rule("SQ", "SQUARE", 100),
        rule("CRES", "CRESCENT", 100),
        rule("TER", "TERRACE", 100),
        rule("CL", "CLOSE", 100),
        rule("PK", "PARK", 100),
        rule("GRN", "GREEN", 100),
        rule("WY", "WAY", 100),
        rule("GRV", "GROVE", 100),
        rule("VW", "VIEW", 100),
        rule("HTS", "HEIGHTS", 100),
        rule("HL", "HILL", 100),
        rule("YD", "YARD", 100),
        rule("MS", "MEWS", 100),
        rule("RIS", "RISE", 100),
        rule("PTH", "PATH", 100),
        rule("WLK", "WALK", 100),
        rule("PDE", "PARADE", 100),
        rule("CIR", "CIRCUS", 100),
        rule("CHYD", "CHURCHYARD", 100),
        rule("ESP", "ESPLANADE", 100),
        rule("PROM", "PROMENADE", 100),
        rule("QY", "QUAY", 100),
        rule("WHF", "WHARF", 100),
        rule("CSWY", "CAUSEWAY", 100),
        rule("BVD", "BOULEVARD", 100),
        rule("GLD", "GLADE", 100),
        // Building types
        rule("APT", "APARTMENT", 90),
        rule("FLT", "FLAT", 90),
        rule("BLDG", "BUILDING", 90),
        rule("HSE", "HOUSE", 90),
        rule("HO", "HOUSE", 90),
        rule("CTG", "COTTAGE", 90),
        rule("COTT", "COTTAGE", 90),
        rule("FM", "FARM", 90),
        rule("MNR", "MANOR", 90),
        rule("VIL", "VILLA", 90),
        // Area types
        rule("EST", "ESTATE", 80),
        rule("INDL", "INDUSTRIAL", 80),
        rule("IND", "INDUSTRIAL", 80),
        rule("CTR", "CENTRE", 80),
        // Directions
        rule("NTH", "NORTH", 70),
        rule("STH", "SOUTH", 70),
        rule("WST", "WEST", 70),
        rule("NE", "NORTH EAST", 70),
        rule("NW", "NORTH WEST", 70),
        rule("SE", "SOUTH EAST", 70),
        rule("SW", "SOUTH WEST", 70),
        // Business-name canonicalisations (highest priority: must beat street
        // rules since they can share tokens, e.g. "CO").
        rule("CO-OP", "COOPERATIVE", 110),
        rule("COOP", "COOPERATIVE", 110),
        rule("CO OP", "COOPERATIVE", 110),
        // "&" is replaced with a space before abbreviation expansion runs, so
        // these must match the post-strip space form, same as "CO OP" above.
        rule("M&S", "MARKS AND SPENCER", 110),
        rule("M S", "MARKS AND SPENCER", 110),
        rule("B&Q", "B AND Q", 110),
        rule("B Q", "B AND Q", 110),
        // Regional
        rule("HANTS", "HAMPSHIRE", 60),
    ];
    rules.sort_by(|a, b| b.priority.cmp(&a.priority));
    rules
}

fn default_localities() -> HashSet<String> {
    [
        "ALTON", "SELBORNE", "LISS", "BENTLEY", "BINSTED", "HOLYBOURNE", "CHAWTON", "MEDSTEAD",
        "BEECH", "KINGSLEY", "HEADLEY", "WHITEHILL", "BORDON", "LINDFORD", "GRAYSHOTT", "PETERSFIELD",
        "HAMPSHIRE",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_multi_word_localities() -> Vec<Vec<String>> {
    vec![
        vec!["FOUR".into(), "MARKS".into()],
        vec!["EAST".into(), "TISTED".into()],
        vec!["WEST".into(), "TISTED".into()],
    ]
}

fn default_stoplist() -> HashSet<String> {
    [
        "THE", "AND", "OF", "AT", "IN", "ON", "LAND", "REAR", "ADJACENT", "TO", "PLOT", "SITE",
        "DEVELOPMENT", "PARCEL",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_descriptors_preserved() -> HashSet<String> {
    [
        "LAND AT",
        "LAND ADJACENT TO",
        "REAR OF",
        "PLOT",
        "PARCEL",
        "SITE",
        "DEVELOPMENT",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_descriptors_stripped() -> HashSet<String> {
    ["PROPOSED", "FORMER"].iter().map(|s| s.to_string()).collect()
}

fn default_rewrites() -> HashMap<String, String> {
    let mut m = HashMap::new();
    m.insert("LUCKY LITE FARM".to_string(), "LUCKYLITE FARM".to_string());
    m
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_at_least_sixty_abbreviation_rules() {
        assert!(RuleSet::default().abbreviations().len() >= 60);
    }

    #[test]
    fn business_rules_outrank_street_rules() {
        let rules = RuleSet::default();
        let co_op = rules
            .abbreviations()
            .iter()
            .find(|r| r.pattern == "CO-OP")
            .unwrap();
        let rd = rules.abbreviations().iter().find(|r| r.pattern == "RD").unwrap();
        assert!(co_op.priority > rd.priority);
    }

    #[test]
    fn rewrite_table_applies_configured_rewrite() {
        let rules = RuleSet::default();
        assert_eq!(rules.apply_rewrites("LUCKY LITE FARM"), "LUCKYLITE FARM");
        assert_eq!(rules.apply_rewrites("UNRELATED STREET"), "UNRELATED STREET");
    }

    #[test]
    fn custom_rewrite_can_be_added() {
        let mut rules = RuleSet::default();
        rules.insert_rewrite("FOO BAR", "FOOBAR");
        assert_eq!(rules.apply_rewrites("1 FOO BAR LANE"), "1 FOOBAR LANE");
    }
}
