//! Version specifier handling.
//!
//! Versions compare component-wise on their dot-separated parts, numerically
//! where both parts are numbers: `3.18.10 > 3.18.9 > 3.18.2`.

use regex::Regex;
use std::cmp::Ordering;
use std::sync::OnceLock;

fn full_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+\.\d+\.\d+$").unwrap_or_else(|e| panic!("{e}")))
}

fn prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+\.\d+$").unwrap_or_else(|e| panic!("{e}")))
}

/// `x.y.z`
pub fn is_full_version(spec: &str) -> bool {
    full_re().is_match(spec)
}

/// `x.y`
pub fn is_minor_prefix(spec: &str) -> bool {
    prefix_re().is_match(spec)
}

/// Numeric-aware ordering of dotted versions.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) => {
                let ord = match (l.parse::<u64>(), r.parse::<u64>()) {
                    (Ok(l), Ok(r)) => l.cmp(&r),
                    _ => l.cmp(r),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// Highest candidate of the form `<prefix>.<patch>`.
pub fn highest_matching<'a, I>(candidates: I, prefix: &str) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let wanted = format!("{prefix}.");
    candidates
        .into_iter()
        .filter(|c| is_full_version(c) && c.starts_with(&wanted))
        .max_by(|a, b| compare_versions(a, b))
        .map(str::to_string)
}

/// `3.18.4` -> `3.18`
pub fn major_minor(version: &str) -> String {
    version.split('.').take(2).collect::<Vec<_>>().join(".")
}
