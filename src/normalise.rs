//! Address normalisation — spec.md §4.1.
//!
//! Pure function of `(raw, rule_set)`: same input and rule-set version always
//! produce the same `Normalised` value (§8 determinism/idempotence
//! invariants).

use regex::Regex;

use crate::error::{MatchEngineError, Result};
use crate::phonetic;
use crate::rules::RuleSet;

#[derive(Debug, Clone, PartialEq)]
pub struct Normalised {
    pub canonical: String,
    pub postcode: Option<String>,
    pub tokens: Vec<String>,
    pub house_number: Option<String>,
    pub locality_tokens: Vec<String>,
    pub street_tokens: Vec<String>,
    pub phonetic_codes: Vec<String>,
}

pub struct Normaliser<'a> {
    rules: &'a RuleSet,
    postcode_re: Regex,
    flat_number_re: Regex,
    house_number_re: Regex,
}

impl<'a> Normaliser<'a> {
    pub fn new(rules: &'a RuleSet) -> Self {
        Self {
            rules,
            postcode_re: Regex::new(
                r"(?i)\b([A-Z]{1,2}\d[\dA-Z]?)\s*(\d[ABD-HJLNP-UW-Z]{2})\b",
            )
            .expect("static postcode regex is valid"),
            flat_number_re: Regex::new(
                r"(?i)\b(?:FLAT|APT|APARTMENT|UNIT|STUDIO)\s+(\d+[A-Z]?)\b",
            )
            .expect("static flat-number regex is valid"),
            house_number_re: Regex::new(r"\b(\d+[A-Z]?)\b").expect("static house-number regex is valid"),
        }
    }

    pub fn normalise(&self, raw: &str) -> Result<Normalised> {
        // 1. Uppercase; trim.
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(MatchEngineError::Normalisation(
                "input is empty after trim".to_string(),
            ));
        }
        let mut working = trimmed.to_uppercase();

        // 2. Postcode extraction; remove from working string on match.
        let postcode = match self.postcode_re.find(&working) {
            Some(mat) => {
                let text = mat.as_str().to_string();
                let range = mat.range();
                working.replace_range(range, " ");
                Some(text.replace(' ', ""))
            }
            None => None,
        };

        // 3. Replace every non-alphanumeric character with a single space.
        let mut cleaned = String::with_capacity(working.len());
        for ch in working.chars() {
            if ch.is_ascii_alphanumeric() {
                cleaned.push(ch);
            } else {
                cleaned.push(' ');
            }
        }

        // 4. Expand abbreviations, word-boundary, priority order.
        let expanded = self.expand_abbreviations(&cleaned);

        // 5. Descriptor handling: strip purely temporal/speculative prefixes.
        let descriptor_stripped = self.strip_stripped_descriptors(&expanded);

        // 6. Collapse whitespace.
        let collapsed = collapse_whitespace(&descriptor_stripped);

        // 6.5. Apply configured rewrites (spec.md §9 open question: hand-
        // crafted corrections consulted before candidate generation).
        let canonical = self.rules.apply_rewrites(&collapsed);

        if canonical.is_empty() {
            return Err(MatchEngineError::Normalisation(
                "input reduces to empty canonical form".to_string(),
            ));
        }

        // 7. Tokenise.
        let tokens: Vec<String> = canonical.split_whitespace().map(|s| s.to_string()).collect();

        // 8. Component extraction.
        let house_number = self.extract_house_number(&canonical);
        let locality_tokens = self.extract_locality_tokens(&tokens);
        let street_tokens = self.extract_street_tokens(&tokens, &locality_tokens, house_number.as_deref());

        // 9. Phonetic codes over street/non-numeric tokens of length >= 2.
        let phonetic_codes = phonetic::encode_all(street_tokens.iter().map(|s| s.as_str()));

        Ok(Normalised {
            canonical,
            postcode,
            tokens,
            house_number,
            locality_tokens,
            street_tokens,
            phonetic_codes,
        })
    }

    fn expand_abbreviations(&self, text: &str) -> String {
        let mut tokens: Vec<String> = text.split_whitespace().map(|s| s.to_string()).collect();
        for rule in self.rules.abbreviations() {
            for token in tokens.iter_mut() {
                if token == rule.pattern {
                    *token = rule.replacement.to_string();
                }
            }
        }
        // Multi-word patterns (e.g. "CO OP") are matched against the joined
        // string after single-token rules have applied.
        let mut joined = tokens.join(" ");
        for rule in self.rules.abbreviations() {
            if rule.pattern.contains(' ') {
                joined = replace_word_boundary(&joined, rule.pattern, rule.replacement);
            }
        }
        joined
    }

    fn strip_stripped_descriptors(&self, text: &str) -> String {
        let mut tokens: Vec<String> = text.split_whitespace().map(|s| s.to_string()).collect();
        while let Some(first) = tokens.first() {
            if self.rules.is_stripped_descriptor(first) {
                tokens.remove(0);
            } else {
                break;
            }
        }
        tokens.join(" ")
    }

    fn extract_house_number(&self, canonical: &str) -> Option<String> {
        if let Some(cap) = self.flat_number_re.captures(canonical) {
            return cap.get(1).map(|m| m.as_str().to_uppercase());
        }
        self.house_number_re
            .find(canonical)
            .map(|m| m.as_str().to_uppercase())
    }

    fn extract_locality_tokens(&self, tokens: &[String]) -> Vec<String> {
        let mut found = Vec::new();
        let mut consumed = vec![false; tokens.len()];

        // Multi-word localities first (longest phrase wins at a position).
        let mut phrases: Vec<&Vec<String>> = self.rules.multi_word_localities().iter().collect();
        phrases.sort_by_key(|p| std::cmp::Reverse(p.len()));
        for phrase in phrases {
            let n = phrase.len();
            if n == 0 || n > tokens.len() {
                continue;
            }
            for start in 0..=(tokens.len() - n) {
                if consumed[start..start + n].iter().any(|c| *c) {
                    continue;
                }
                if tokens[start..start + n]
                    .iter()
                    .zip(phrase.iter())
                    .all(|(a, b)| a == b)
                {
                    found.push(phrase.join(" "));
                    for c in consumed[start..start + n].iter_mut() {
                        *c = true;
                    }
                }
            }
        }

        for (i, token) in tokens.iter().enumerate() {
            if consumed[i] {
                continue;
            }
            if self.rules.is_locality(token) {
                found.push(token.clone());
            }
        }
        found
    }

    fn extract_street_tokens(
        &self,
        tokens: &[String],
        locality_tokens: &[String],
        house_number: Option<&str>,
    ) -> Vec<String> {
        let locality_set: std::collections::HashSet<&str> =
            locality_tokens.iter().flat_map(|l| l.split_whitespace()).collect();
        tokens
            .iter()
            .filter(|t| {
                let is_number = t.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false);
                let is_house_number = house_number.map(|h| h == t.as_str()).unwrap_or(false);
                !is_number
                    && !is_house_number
                    && !locality_set.contains(t.as_str())
                    && !self.rules.is_stopword(t)
            })
            .cloned()
            .collect()
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn replace_word_boundary(text: &str, pattern: &str, replacement: &str) -> String {
    if !text.contains(pattern) {
        return text.to_string();
    }
    let re = Regex::new(&format!(r"\b{}\b", regex::escape(pattern))).unwrap();
    re.replace_all(text, replacement).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalise(raw: &str) -> Normalised {
        let rules = RuleSet::default();
        let normaliser = Normaliser::new(&rules);
        normaliser.normalise(raw).unwrap()
    }

    #[test]
    fn empty_input_errors() {
        let rules = RuleSet::default();
        let normaliser = Normaliser::new(&rules);
        assert!(matches!(
            normaliser.normalise("   "),
            Err(MatchEngineError::Normalisation(_))
        ));
    }

    #[test]
    fn extracts_postcode_and_strips_internal_space() {
        let n = normalise("Flat 2, 15 Station Rd, GU34 1AA");
        assert_eq!(n.postcode.as_deref(), Some("GU341AA"));
        assert!(!n.canonical.contains("GU34"));
    }

    #[test]
    fn expands_street_type_abbreviations() {
        let n = normalise("12 HIGH ST ALTON");
        assert!(n.canonical.contains("STREET"));
        assert!(!n.canonical.split_whitespace().any(|t| t == "ST"));
    }

    #[test]
    fn strips_proposed_and_former_prefixes() {
        let n = normalise("PROPOSED DWELLING AT 4 OAK LANE");
        assert!(!n.canonical.starts_with("PROPOSED"));
    }

    #[test]
    fn preserves_land_at_descriptor_tokens() {
        let n = normalise("LAND AT 12 MILL LANE ALTON");
        assert!(n.canonical.contains("LAND AT"));
    }

    #[test]
    fn extracts_house_number_and_locality() {
        let n = normalise("12A PETERSFIELD AVENUE FOUR MARKS");
        assert_eq!(n.house_number.as_deref(), Some("12A"));
        assert!(n.locality_tokens.iter().any(|l| l == "FOUR MARKS"));
        assert!(n.street_tokens.iter().any(|t| t == "PETERSFIELD"));
    }

    #[test]
    fn extracts_flat_number_as_house_number() {
        let n = normalise("FLAT 2 15 STATION ROAD");
        assert_eq!(n.house_number.as_deref(), Some("2"));
    }

    #[test]
    fn normalisation_is_idempotent() {
        let rules = RuleSet::default();
        let normaliser = Normaliser::new(&rules);
        let first = normaliser.normalise("12 HIGH ST ALTON").unwrap();
        let second = normaliser.normalise(&first.canonical).unwrap();
        assert_eq!(first.canonical, second.canonical);
    }

    #[test]
    fn normalisation_is_deterministic() {
        let n1 = normalise("21 HIGH STREET ALTON");
        let n2 = normalise("21 HIGH STREET ALTON");
        assert_eq!(n1, n2);
    }

    #[test]
    fn street_tokens_exclude_stoplist_words() {
        let n = normalise("REAR OF 4 THE GREEN ALTON");
        assert!(!n.street_tokens.iter().any(|t| t == "REAR" || t == "OF" || t == "THE"));
    }

    #[test]
    fn expands_ampersand_business_names() {
        // "&" is stripped to a space before abbreviation expansion runs, so
        // the business rules must match the post-strip "M S"/"B Q" form.
        let n = normalise("UNIT 3 M&S ALTON RETAIL PARK");
        assert!(n.canonical.contains("MARKS AND SPENCER"));

        let n = normalise("B&Q ALTON");
        assert!(n.canonical.contains("B AND Q"));
    }
}
