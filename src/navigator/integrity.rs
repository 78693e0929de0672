//! Content-integrity policy for targeted, partial modifications.
//!
//! Given the original artifact, a proposed replacement, and the change that
//! was asked for, decide whether the candidate wiped the artifact, touched
//! anything outside the targeted occurrences, or skipped the change.

use serde::{Deserialize, Serialize};

use crate::model::{Change, TargetedEdit};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    /// The candidate is blank while the requested result is not.
    pub emptied: bool,
    /// Everything outside the targeted occurrences survived unchanged.
    pub outside_preserved: bool,
    /// Every targeted occurrence was removed or replaced.
    pub change_applied: bool,
}

impl IntegrityReport {
    /// Wholesale loss or collateral edits. Never approvable.
    pub const fn is_violation(&self) -> bool {
        self.emptied || !self.outside_preserved
    }

    pub const fn is_clean(&self) -> bool {
        !self.is_violation() && self.change_applied
    }

    /// Human-readable findings, worst first.
    pub fn findings(&self, path: &str) -> Vec<String> {
        let mut out = Vec::new();
        if self.emptied {
            out.push(format!("{path} was emptied; only the targeted text may be removed"));
        }
        if !self.outside_preserved {
            out.push(format!(
                "content of {path} outside the targeted change was altered or dropped"
            ));
        }
        if !self.change_applied {
            out.push(format!("the requested change was not applied to {path}"));
        }
        out
    }
}

/// The canonical result of applying `change` to `original`.
pub fn expected(original: &str, change: &Change) -> String {
    let needle = change.needle();
    if needle.is_empty() {
        return original.to_string();
    }
    original.replace(needle, change.replacement())
}

pub fn check(original: &str, candidate: &str, change: &Change) -> IntegrityReport {
    let needle = change.needle();
    let emptied = candidate.trim().is_empty() && !expected(original, change).trim().is_empty();

    if needle.is_empty() {
        return IntegrityReport {
            emptied,
            outside_preserved: candidate == original,
            change_applied: false,
        };
    }

    let (outside_preserved, change_applied) =
        match match_segments(original, needle, change.replacement(), candidate) {
            Some(all_applied) => (true, all_applied),
            None => (false, !candidate.contains(needle)),
        };

    IntegrityReport {
        emptied,
        outside_preserved,
        change_applied,
    }
}

/// Run [`check`] against the proposed file for an edit. A candidate that
/// lacks the file entirely counts as an untouched artifact.
pub fn check_edit(edit: &TargetedEdit, candidate: Option<&str>) -> IntegrityReport {
    candidate.map_or_else(
        || check(&edit.original, &edit.original, &edit.change),
        |c| check(&edit.original, c, &edit.change),
    )
}

/// Walk the original split on `needle`, consuming each surviving segment
/// from `candidate` in order.
///
/// At every join the candidate may hold the original needle (not applied) or
/// the replacement, with the surrounding whitespace intact. A removal may
/// also collapse the whitespace on both sides of the join into one of the two
/// runs, but never fuse text that had whitespace on both sides. Returns
/// `Some(all_applied)` when the whole candidate is accounted for, `None` when
/// something outside the target differs.
fn match_segments(original: &str, needle: &str, replacement: &str, candidate: &str) -> Option<bool> {
    let segments: Vec<&str> = original.split(needle).collect();
    let last = segments.len() - 1;
    let parts: Vec<Segment<'_>> = segments
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let body = if i == 0 { *s } else { s.trim_start() };
            let core = if i == last { body } else { body.trim_end() };
            Segment {
                lead: &s[..s.len() - body.len()],
                core,
                trail: &body[core.len()..],
            }
        })
        .collect();
    let joins = Joins { needle, replacement };
    joins.walk(&parts, 0, candidate)
}

#[derive(Debug, Clone, Copy)]
struct Segment<'a> {
    lead: &'a str,
    core: &'a str,
    trail: &'a str,
}

struct Joins<'a> {
    needle: &'a str,
    replacement: &'a str,
}

impl Joins<'_> {
    /// Accepted spellings of one join, applied forms first.
    fn forms(&self, before: &str, after: &str) -> Vec<(String, bool)> {
        let mut applied = Vec::new();
        if self.replacement.is_empty() {
            applied.push(format!("{before}{after}"));
            if before.is_empty() || after.is_empty() {
                applied.push(String::new());
            } else {
                applied.push(before.to_string());
                applied.push(after.to_string());
            }
        } else {
            applied.push(format!("{before}{}{after}", self.replacement));
        }

        let mut forms: Vec<(String, bool)> = Vec::new();
        for form in applied {
            if !forms.iter().any(|(f, _)| *f == form) {
                forms.push((form, true));
            }
        }
        forms.push((format!("{before}{}{after}", self.needle), false));
        forms
    }

    fn walk(&self, parts: &[Segment<'_>], i: usize, rest: &str) -> Option<bool> {
        let segment = parts[i];
        let rest = rest.strip_prefix(segment.core)?;
        let Some(next) = parts.get(i + 1) else {
            return rest.is_empty().then_some(true);
        };
        for (form, applied) in self.forms(segment.trail, next.lead) {
            if let Some(tail) = rest.strip_prefix(form.as_str())
                && let Some(all_applied) = self.walk(parts, i + 1, tail)
            {
                return Some(applied && all_applied);
            }
        }
        None
    }
}
