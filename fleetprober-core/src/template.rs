//! `@label@` substitution in probe options and command arguments.
//!
//! Tokens look like `@target@` or `@target.label.zone@`. A token whose label
//! is present in the map is replaced, delimiters included; unknown tokens are
//! left untouched so the caller can decide whether that is a problem.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"@([^@]+)@").expect("static regex")
});

/// Replace `@label@` tokens in `text` with values from `labels`.
///
/// Returns the substituted string and whether every token was found in the
/// map.
pub fn substitute_labels(text: &str, labels: &HashMap<String, String>) -> (String, bool) {
    let mut all_found = true;
    let result = TOKEN_RE.replace_all(text, |caps: &regex::Captures<'_>| {
        match labels.get(&caps[1]) {
            Some(value) => value.clone(),
            None => {
                all_found = false;
                caps[0].to_string()
            }
        }
    });
    (result.into_owned(), all_found)
}
