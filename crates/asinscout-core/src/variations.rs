//! Alternate phrasings of a lookup query.
//!
//! When the exact input exhausts every source below the acceptance threshold,
//! the orchestrator re-runs the sources over these variations. The sequence
//! is finite, ordered by descending prior of success, de-duplicated by
//! fingerprint, and always starts with the unmodified original so the exact
//! input never pays the variation cost.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::normalize::{normalize, title_match_score};
use crate::LookupQuery;

static LEADING_ARTICLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(the|an|a)\s+").unwrap());

/// How many fuzzy index candidates a single query may contribute.
const MAX_FUZZY_CANDIDATES: usize = 3;

/// Known titles (typically the caller's library or a series list) used for
/// edit-distance rescue of garbled input. Optional: without one, the fuzzy
/// step degrades to a no-op.
#[derive(Debug, Default, Clone)]
pub struct TitleIndex {
    titles: Vec<String>,
}

impl TitleIndex {
    pub fn new(titles: Vec<String>) -> Self {
        Self { titles }
    }

    pub fn is_empty(&self) -> bool {
        self.titles.is_empty()
    }

    /// Indexed titles scoring at least `threshold` against `title`, best
    /// first, capped at [`MAX_FUZZY_CANDIDATES`].
    fn candidates(&self, title: &str, threshold: f64) -> Vec<String> {
        let mut scored: Vec<(f64, &String)> = self
            .titles
            .iter()
            .map(|t| (title_match_score(title, t), t))
            .filter(|(score, _)| *score >= threshold)
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored
            .into_iter()
            .take(MAX_FUZZY_CANDIDATES)
            .map(|(_, t)| t.clone())
            .collect()
    }
}

/// Generate the ordered, de-duplicated variation sequence for `query`.
///
/// Priority order: the original, series/subtitle stripping, leading-article
/// removal, separator normalization, author canonicalization, fuzzy index
/// candidates. `cap` bounds the total length.
pub fn variations(
    query: &LookupQuery,
    index: Option<&TitleIndex>,
    fuzzy_threshold: f64,
    cap: usize,
) -> Vec<LookupQuery> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out: Vec<LookupQuery> = Vec::new();
    let mut push = |q: LookupQuery, out: &mut Vec<LookupQuery>| {
        if out.len() < cap && seen.insert(q.fingerprint()) {
            out.push(q);
        }
    };

    push(query.clone(), &mut out);

    let Some(title) = query.title() else {
        // ISBN-only query: nothing to rephrase.
        return out;
    };

    for t in title_variants(title) {
        push(query.with_title(t), &mut out);
    }

    if let Some(author) = query.author() {
        for a in author_variants(author) {
            push(query.with_author(Some(a)), &mut out);
        }
        // Last resort: an author that never matches can sink every search.
        push(query.with_author(None), &mut out);
    }

    if let Some(index) = index {
        for candidate in index.candidates(title, fuzzy_threshold) {
            push(query.with_title(candidate), &mut out);
        }
    }

    out
}

/// Title rephrasings, in priority order, excluding the original.
fn title_variants(title: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut push = |s: String| {
        let s = s.trim().to_string();
        if !s.is_empty() && normalize(&s) != normalize(title) && !out.contains(&s) {
            out.push(s);
        }
    };

    // (a) series/subtitle stripping: both halves of a qualified title
    if let Some((series, subtitle)) = split_qualified(title) {
        push(series.to_string());
        push(subtitle.to_string());
        push(LEADING_ARTICLE.replace(subtitle, "").into_owned());
    }

    // (b) leading-article removal
    push(LEADING_ARTICLE.replace(title, "").into_owned());

    // (c) separator normalization: colon and dash forms are interchangeable
    if title.contains(':') {
        push(title.replacen(':', " -", 1));
    } else if title.contains(" - ") {
        push(title.replacen(" - ", ": ", 1));
    }

    out
}

/// Split "Series: Subtitle" or "Series - Subtitle" into its halves.
fn split_qualified(title: &str) -> Option<(&str, &str)> {
    let (head, tail) = title
        .split_once(':')
        .or_else(|| title.split_once(" - "))?;
    let head = head.trim();
    let tail = tail.trim();
    (!head.is_empty() && !tail.is_empty()).then_some((head, tail))
}

/// Author rephrasings: full name -> initials -> surname-only.
fn author_variants(author: &str) -> Vec<String> {
    let tokens: Vec<&str> = author.split_whitespace().collect();
    if tokens.len() < 2 {
        return Vec::new();
    }

    let surname = *tokens.last().unwrap();
    let mut out = Vec::new();

    // Initials form: "Brandon Sanderson" -> "B. Sanderson"
    let initials: Vec<String> = tokens[..tokens.len() - 1]
        .iter()
        .filter_map(|t| t.chars().next())
        .map(|c| format!("{}.", c.to_uppercase()))
        .collect();
    if !initials.is_empty() {
        let abbreviated = format!("{} {}", initials.join(" "), surname);
        if normalize(&abbreviated) != normalize(author) {
            out.push(abbreviated);
        }
    }

    out.push(surname.to_string());
    out
}
