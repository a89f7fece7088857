//! Text normalization and similarity scoring.
//!
//! Cache fingerprints and all fuzzy comparisons go through [`normalize`] so
//! that casing, incidental whitespace, diacritics and typographic punctuation
//! never produce distinct keys or depress match scores.

use once_cell::sync::Lazy;
use rapidfuzz::distance::levenshtein;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Lowercase, strip diacritics (NFKD + combining-mark removal), fold curly
/// quotes and dash variants to ASCII, collapse whitespace runs, trim.
/// Idempotent: `normalize(normalize(s)) == normalize(s)`.
pub fn normalize(s: &str) -> String {
    let folded: String = s
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .map(|c| match c {
            '\u{2018}' | '\u{2019}' => '\'',
            '\u{201c}' | '\u{201d}' => '"',
            '\u{2013}' | '\u{2014}' => '-',
            _ => c,
        })
        .flat_map(char::to_lowercase)
        .collect();
    WHITESPACE.replace_all(folded.trim(), " ").into_owned()
}

/// Order-stable fingerprint of a query: `isbn|title|author` over normalized
/// components. Queries differing only in case or incidental whitespace map to
/// the same fingerprint.
pub fn fingerprint(isbn: Option<&str>, title: Option<&str>, author: Option<&str>) -> String {
    format!(
        "{}|{}|{}",
        normalize(isbn.unwrap_or("")),
        normalize(title.unwrap_or("")),
        normalize(author.unwrap_or(""))
    )
}

/// Normalized Levenshtein similarity in `[0, 1]` over normalized inputs.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = normalize(a);
    let b = normalize(b);
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    levenshtein::normalized_similarity(a.chars(), b.chars())
}

/// Title similarity tolerant of series qualifiers.
///
/// A plain edit distance punishes "Final Empire" against
/// "Mistborn: The Final Empire" even though the shorter form names the same
/// book, so a normalized-substring containment scores 0.95 and the edit
/// distance covers genuinely garbled titles.
pub fn title_match_score(query: &str, candidate: &str) -> f64 {
    let q = normalize(query);
    let c = normalize(candidate);
    if q.is_empty() || c.is_empty() {
        return 0.0;
    }
    if q == c {
        return 1.0;
    }
    let full = levenshtein::normalized_similarity(q.chars(), c.chars());
    let contained = if c.contains(&q) || q.contains(&c) {
        0.95
    } else {
        0.0
    };
    full.max(contained)
}

/// Author similarity tolerant of abbreviated forms.
///
/// "B. Sanderson", "Brandon Sanderson" and "Sanderson" all refer to the same
/// person as far as upstream catalogs are concerned: when the surnames agree
/// and the given names don't conflict (one is an initial of the other, or
/// absent), score high without requiring the full strings to align.
pub fn author_similarity(a: &str, b: &str) -> f64 {
    let a = normalize(a);
    let b = normalize(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }

    let a_toks: Vec<&str> = a.split(' ').collect();
    let b_toks: Vec<&str> = b.split(' ').collect();
    let a_surname = a_toks.last().unwrap();
    let b_surname = b_toks.last().unwrap();

    if levenshtein::normalized_similarity(a_surname.chars(), b_surname.chars()) >= 0.9 {
        let given_compatible = given_names_compatible(&a_toks, &b_toks);
        if given_compatible {
            return 0.95;
        }
        return 0.7;
    }

    levenshtein::normalized_similarity(a.chars(), b.chars())
}

/// Given-name token lists are compatible when either is empty or each pair of
/// corresponding tokens matches on the first letter (initials) or in full.
fn given_names_compatible(a_toks: &[&str], b_toks: &[&str]) -> bool {
    let a_given = &a_toks[..a_toks.len() - 1];
    let b_given = &b_toks[..b_toks.len() - 1];
    if a_given.is_empty() || b_given.is_empty() {
        return true;
    }
    a_given.iter().zip(b_given.iter()).all(|(ga, gb)| {
        let ga = ga.trim_end_matches('.');
        let gb = gb.trim_end_matches('.');
        ga == gb
            || (ga.len() == 1 && gb.starts_with(ga))
            || (gb.len() == 1 && ga.starts_with(gb))
    })
}
