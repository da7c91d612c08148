//! Phonetic coder — spec.md §4.2, §4.1 step 9.
//!
//! A small Double-Metaphone-style consonant-skeleton code, used to rescue
//! fuzzy matches where trigram similarity alone would miss a phonetically
//! equivalent but differently-spelled street name (`PETERSFEILD` vs
//! `PETERSFIELD`).

const VOWELS: [char; 5] = ['A', 'E', 'I', 'O', 'U'];

/// Encode a single token into a phonetic key. Deterministic, pure.
pub fn encode(token: &str) -> String {
    let upper = token.to_uppercase();
    let chars: Vec<char> = upper.chars().collect();
    let mut buf = String::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        let next2 = chars.get(i + 2).copied();

        if c == 'S' && next == Some('C') && next2 == Some('H') {
            buf.push_str("SK");
            i += 3;
            continue;
        }

        match (c, next) {
            ('P', Some('H')) | ('G', Some('H')) => {
                buf.push('F');
                i += 2;
                continue;
            }
            ('C', Some('K')) => {
                buf.push('K');
                i += 2;
                continue;
            }
            ('K', Some('N')) => {
                buf.push('N');
                i += 2;
                continue;
            }
            ('W', Some('R')) => {
                buf.push('R');
                i += 2;
                continue;
            }
            ('P', Some('S')) => {
                buf.push('S');
                i += 2;
                continue;
            }
            ('Q', Some('U')) => {
                buf.push_str("KW");
                i += 2;
                continue;
            }
            ('T', Some('H')) => {
                buf.push('0');
                i += 2;
                continue;
            }
            ('S', Some('H')) | ('C', Some('H')) => {
                buf.push('X');
                i += 2;
                continue;
            }
            ('W', Some('H')) => {
                buf.push('W');
                i += 2;
                continue;
            }
            _ => {}
        }

        if c == 'C' && matches!(next, Some('E') | Some('I') | Some('Y')) {
            buf.push('K');
            i += 1;
            continue;
        }
        if c == 'G' && matches!(next, Some('E') | Some('I') | Some('Y')) {
            buf.push('J');
            i += 1;
            continue;
        }
        if c == 'Y' {
            buf.push('I');
            i += 1;
            continue;
        }
        if c == 'Z' {
            buf.push('S');
            i += 1;
            continue;
        }

        buf.push(c);
        i += 1;
    }

    let collapsed = collapse_doubles(&buf);
    let trimmed = strip_interior_vowels(&collapsed);
    let deduped = collapse_doubles(&trimmed);
    deduped.chars().take(6).collect()
}

/// Encode every token of length >= 2 in order; callers typically filter to
/// street/non-numeric tokens per spec.md §4.1 step 9 before calling this.
pub fn encode_all<'a, I: IntoIterator<Item = &'a str>>(tokens: I) -> Vec<String> {
    tokens
        .into_iter()
        .filter(|t| t.chars().count() >= 2)
        .map(encode)
        .collect()
}

/// Count of codes from `a` that also appear in `b`; each code in `a` is
/// counted at most once, regardless of how many times it repeats in `a` or
/// `b` — spec.md §4.2.
pub fn overlap(a: &[String], b: &[String]) -> usize {
    let b_set: std::collections::HashSet<&str> = b.iter().map(|s| s.as_str()).collect();
    let mut seen: std::collections::HashSet<&str> = std::collections::HashSet::new();
    let mut count = 0;
    for code in a {
        if b_set.contains(code.as_str()) && seen.insert(code.as_str()) {
            count += 1;
        }
    }
    count
}

fn collapse_doubles(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        if out.chars().last() != Some(ch) {
            out.push(ch);
        }
    }
    out
}

fn strip_interior_vowels(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for (idx, ch) in s.chars().enumerate() {
        if idx == 0 || !VOWELS.contains(&ch) {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_is_deterministic() {
        assert_eq!(encode("PETERSFIELD"), encode("PETERSFIELD"));
    }

    #[test]
    fn encode_truncates_to_six_chars() {
        assert!(encode("EXTRAORDINARILY").chars().count() <= 6);
    }

    #[test]
    fn petersfield_and_misspelling_share_a_code() {
        let codes_a = encode_all(["PETERSFIELD"]);
        let codes_b = encode_all(["PETERSFEILD"]);
        // Both reduce through the same consonant skeleton after vowel
        // stripping and TH/PH-style digraph handling.
        assert_eq!(overlap(&codes_a, &codes_b), 1, "{codes_a:?} vs {codes_b:?}");
    }

    #[test]
    fn overlap_counts_each_code_at_most_once() {
        let a = vec!["PTS".to_string(), "PTS".to_string()];
        let b = vec!["PTS".to_string()];
        assert_eq!(overlap(&a, &b), 1);
    }

    #[test]
    fn th_digraph_maps_to_zero() {
        assert!(encode("THAMES").contains('0'));
    }

    #[test]
    fn empty_token_encodes_to_empty_string() {
        assert_eq!(encode(""), "");
    }
}
