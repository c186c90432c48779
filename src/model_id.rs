//! Model identifier normalization and fuzzy matching.
//!
//! Node model ids drift between surfaces: the admin API reports
//! `qwen/qwen3-4b-2507`, a config file may say `Qwen3 4B 2507`, a GGUF
//! filename adds `-Instruct`. Two ids are considered the same model when
//! lowercasing and stripping every non-alphanumeric character yields the
//! same string.

/// Reserved ids that mean "no model configured" rather than a real target.
const PLACEHOLDER_IDS: &[&str] = &["none", "default", "auto"];

/// Normalize a model id for comparison: lowercase, strip all
/// non-alphanumeric characters. Placeholder ids normalize to the empty
/// string so they never match a real model.
pub fn normalize(id: &str) -> String {
    let trimmed = id.trim();
    if PLACEHOLDER_IDS.iter().any(|p| trimmed.eq_ignore_ascii_case(p)) {
        return String::new();
    }
    trimmed
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// True when the two ids normalize to the same non-empty string.
pub fn ids_match(a: &str, b: &str) -> bool {
    let na = normalize(a);
    !na.is_empty() && na == normalize(b)
}

/// Find the first candidate whose normalized form equals the normalized
/// query. Returns the candidate as stored (the node's canonical spelling).
pub fn find_match<'a>(candidates: &'a [String], query: &str) -> Option<&'a str> {
    let needle = normalize(query);
    if needle.is_empty() {
        return None;
    }
    candidates
        .iter()
        .find(|c| normalize(c) == needle)
        .map(|s| s.as_str())
}
