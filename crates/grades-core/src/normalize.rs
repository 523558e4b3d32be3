//! Name normalization and trigram similarity.
//!
//! [`normalize`] derives the canonical search key stored next to every
//! inspection record. [`trigrams`] and [`similarity`] implement the same
//! padded-word trigram model as PostgreSQL's `pg_trgm`, so scores stay
//! comparable with the thresholds used by the city-data tooling.

use std::collections::BTreeSet;

use unicode_normalization::{UnicodeNormalization, char::is_combining_mark};

/// Characters dropped without leaving a word break, so `Joe's` and `P.J.`
/// collapse to `joes` and `pj`.
fn is_elided(c: char) -> bool {
  matches!(c, '\'' | '\u{2018}' | '\u{2019}' | '`' | '\u{00B4}' | '.')
}

/// Canonical search key for a free-form establishment name.
///
/// Total and idempotent: `normalize(&normalize(x)) == normalize(x)` for every
/// input. Garbage input yields an empty key.
pub fn normalize(raw: &str) -> String {
  let mut key = String::with_capacity(raw.len());
  let mut gap = false;

  let chars = raw
    .chars()
    .filter(|c| !is_elided(*c))
    .nfkd()
    .flat_map(char::to_lowercase)
    .nfkd()
    .filter(|c| !is_combining_mark(*c) && !is_elided(*c));

  for c in chars {
    if c == '&' {
      push_word(&mut key, &mut gap, "and");
      gap = true;
    } else if c.is_alphanumeric() {
      if gap && !key.is_empty() {
        key.push(' ');
      }
      gap = false;
      key.push(c);
    } else {
      gap = true;
    }
  }

  key
}

fn push_word(key: &mut String, gap: &mut bool, word: &str) {
  if !key.is_empty() {
    key.push(' ');
  }
  key.push_str(word);
  *gap = false;
}

/// The set of padded word trigrams of an already-normalized key.
///
/// Each word is padded with two leading blanks and one trailing blank, so
/// `"joes"` yields `"  j"`, `" jo"`, `"joe"`, `"oes"` and `"es "`.
pub fn trigrams(key: &str) -> BTreeSet<String> {
  let mut out = BTreeSet::new();
  for word in key.split_whitespace() {
    let padded: Vec<char> = "  "
      .chars()
      .chain(word.chars())
      .chain(std::iter::once(' '))
      .collect();
    for window in padded.windows(3) {
      out.insert(window.iter().collect());
    }
  }
  out
}

/// Jaccard similarity of the trigram sets of two normalized keys, in `0..=1`.
pub fn similarity(a: &str, b: &str) -> f64 {
  let left = trigrams(a);
  let right = trigrams(b);
  if left.is_empty() && right.is_empty() {
    return 0.0;
  }
  let shared = left.intersection(&right).count();
  let union = left.len() + right.len() - shared;
  shared as f64 / union as f64
}
