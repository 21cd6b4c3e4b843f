/// Segment-wise glob matching for record listings
///
/// Supports `*` and `?` within a segment and `**` across segments. Hidden
/// names (leading `.`) only match a pattern segment that itself starts with
/// `.`, which keeps temp files and the lock file out of ordinary listings.

use crate::store::error::{StoreError, StoreResult};
use crate::store::paths::RecordPath;

/// A compiled, root-relative glob pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobPattern {
    segments: Vec<String>,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> StoreResult<Self> {
        let normalized = pattern.replace('\\', "/");
        if normalized.starts_with('/') {
            return Err(StoreError::invalid_path(pattern, "glob must be relative to the store root"));
        }

        let segments: Vec<String> = normalized
            .split('/')
            .filter(|s| !s.is_empty() && *s != ".")
            .map(str::to_string)
            .collect();
        if segments.is_empty() {
            return Err(StoreError::invalid_path(pattern, "empty glob"));
        }
        if segments.iter().any(|s| s == "..") {
            return Err(StoreError::invalid_path(pattern, "parent components are not allowed"));
        }
        Ok(Self { segments })
    }

    /// Literal directory prefix before the first wildcard, used to narrow the walk
    pub fn literal_prefix(&self) -> Vec<&str> {
        self.segments
            .iter()
            .take(self.segments.len().saturating_sub(1))
            .take_while(|s| !s.contains(['*', '?']))
            .map(String::as_str)
            .collect()
    }

    pub fn matches(&self, path: &RecordPath) -> bool {
        let pattern: Vec<&str> = self.segments.iter().map(String::as_str).collect();
        let names: Vec<&str> = path.segments().collect();
        match_segments(&pattern, &names)
    }
}

fn match_segments(pattern: &[&str], names: &[&str]) -> bool {
    match pattern.split_first() {
        None => names.is_empty(),
        Some((&"**", rest)) => (0..=names.len()).any(|skip| {
            names[..skip].iter().all(|n| !n.starts_with('.')) && match_segments(rest, &names[skip..])
        }),
        Some((segment, rest)) => match names.split_first() {
            Some((name, tail)) => match_name(segment, name) && match_segments(rest, tail),
            None => false,
        },
    }
}

fn match_name(pattern: &str, name: &str) -> bool {
    if name.starts_with('.') && !pattern.starts_with('.') {
        return false;
    }
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();

    // Iterative wildcard match with single-star backtracking
    let (mut pi, mut ni) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while ni < n.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ni));
            pi += 1;
        } else if let Some((star_pi, star_ni)) = star {
            pi = star_pi + 1;
            ni = star_ni + 1;
            star = Some((star_pi, star_ni + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}
