//! Unified line diffs between script versions.
//!
//! Lines keep their terminators, so a final line with and without a trailing
//! newline compare unequal and the missing one is flagged with
//! `\ No newline at end of file`, as `diff -u` does.

use anyhow::{anyhow, bail, Result};
use regex::Regex;
use std::ops::Range;
use std::sync::LazyLock;

/// Inputs larger than this (old + new lines) are refused. Worst-case time
/// grows with the square of the line count; memory stays linear.
pub const MAX_DIFF_LINES: usize = 20_000;

const NO_NEWLINE: &str = "\\ No newline at end of file";

// ─── Edit script ──────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Op {
    Equal,
    Delete,
    Insert,
}

/// One edit, with the old/new line positions it applies at (0-based).
#[derive(Clone, Copy, Debug)]
struct Edit {
    op: Op,
    old: usize,
    new: usize,
}

/// Diagonal-indexed furthest-reaching x values, `k` in `-max..=max`.
struct V {
    offset: isize,
    v: Vec<usize>,
}

impl V {
    fn new(max_d: usize) -> Self {
        Self {
            offset: max_d as isize,
            v: vec![0; 2 * max_d + 1],
        }
    }
}

impl std::ops::Index<isize> for V {
    type Output = usize;

    fn index(&self, k: isize) -> &usize {
        &self.v[(k + self.offset) as usize]
    }
}

impl std::ops::IndexMut<isize> for V {
    fn index_mut(&mut self, k: isize) -> &mut usize {
        &mut self.v[(k + self.offset) as usize]
    }
}

fn common_prefix(a: &[&str], b: &[&str]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

fn common_suffix(a: &[&str], b: &[&str]) -> usize {
    a.iter()
        .rev()
        .zip(b.iter().rev())
        .take_while(|(x, y)| x == y)
        .count()
}

/// Myers' shortest edit script in linear space.
///
/// Each level finds the middle snake of the remaining edit graph and splits
/// there, so memory stays `O(N + M)` whatever the edit distance.
fn myers(a: &[&str], b: &[&str]) -> Vec<Edit> {
    let max_d = (a.len() + b.len() + 1) / 2 + 1;
    let mut vf = V::new(max_d);
    let mut vb = V::new(max_d);
    let mut edits = Vec::with_capacity(a.len().max(b.len()));
    conquer(a, 0..a.len(), b, 0..b.len(), &mut vf, &mut vb, &mut edits);
    edits
}

fn conquer(
    a: &[&str],
    mut old: Range<usize>,
    b: &[&str],
    mut new: Range<usize>,
    vf: &mut V,
    vb: &mut V,
    edits: &mut Vec<Edit>,
) {
    let prefix = common_prefix(&a[old.clone()], &b[new.clone()]);
    push_equal(edits, old.start, new.start, prefix);
    old.start += prefix;
    new.start += prefix;

    let suffix = common_suffix(&a[old.clone()], &b[new.clone()]);
    old.end -= suffix;
    new.end -= suffix;

    if old.is_empty() {
        for y in new.clone() {
            edits.push(Edit {
                op: Op::Insert,
                old: old.start,
                new: y,
            });
        }
    } else if new.is_empty() {
        for x in old.clone() {
            edits.push(Edit {
                op: Op::Delete,
                old: x,
                new: new.start,
            });
        }
    } else if let Some((x, y)) = middle_snake(a, old.clone(), b, new.clone(), vf, vb) {
        conquer(a, old.start..x, b, new.start..y, vf, vb, edits);
        conquer(a, x..old.end, b, y..new.end, vf, vb, edits);
    } else {
        for x in old.clone() {
            edits.push(Edit {
                op: Op::Delete,
                old: x,
                new: new.start,
            });
        }
        for y in new.clone() {
            edits.push(Edit {
                op: Op::Insert,
                old: old.end,
                new: y,
            });
        }
    }

    push_equal(edits, old.end, new.end, suffix);
}

fn push_equal(edits: &mut Vec<Edit>, old: usize, new: usize, len: usize) {
    for i in 0..len {
        edits.push(Edit {
            op: Op::Equal,
            old: old + i,
            new: new + i,
        });
    }
}

/// Absolute `(x, y)` where a middle snake of the edit graph starts.
///
/// Both ranges must be non-empty and must not share a first or last line.
fn middle_snake(
    a: &[&str],
    old: Range<usize>,
    b: &[&str],
    new: Range<usize>,
    vf: &mut V,
    vb: &mut V,
) -> Option<(usize, usize)> {
    let n = old.len();
    let m = new.len();
    let delta = n as isize - m as isize;
    let odd = delta & 1 == 1;
    let max_d = ((n + m + 1) / 2 + 1) as isize;
    vf[1] = 0;
    vb[1] = 0;

    for d in 0..max_d {
        let mut k = d;
        while k >= -d {
            let mut x = if k == -d || (k != d && vf[k - 1] < vf[k + 1]) {
                vf[k + 1]
            } else {
                vf[k - 1] + 1
            };
            let y = (x as isize - k) as usize;
            let (x0, y0) = (x, y);
            if x < n && y < m {
                x += common_prefix(&a[old.start + x..old.end], &b[new.start + y..new.end]);
            }
            vf[k] = x;
            if odd && (k - delta).abs() < d && vf[k] + vb[-(k - delta)] >= n {
                return Some((old.start + x0, new.start + y0));
            }
            k -= 2;
        }

        let mut k = d;
        while k >= -d {
            let mut x = if k == -d || (k != d && vb[k - 1] < vb[k + 1]) {
                vb[k + 1]
            } else {
                vb[k - 1] + 1
            };
            let mut y = (x as isize - k) as usize;
            if x < n && y < m {
                let advance = common_suffix(
                    &a[old.start..old.start + n - x],
                    &b[new.start..new.start + m - y],
                );
                x += advance;
                y += advance;
            }
            vb[k] = x;
            if !odd && (k - delta).abs() <= d && vb[k] + vf[-(k - delta)] >= n {
                return Some((old.start + n - x, new.start + m - y));
            }
            k -= 2;
        }
    }
    None
}

/// Group changes into hunk ranges over `edits`, each padded with `context`
/// equal lines. Changes closer than `2 * context` share a hunk.
fn hunk_ranges(edits: &[Edit], context: usize) -> Vec<Range<usize>> {
    let is_equal = |i: usize| edits[i].op == Op::Equal;
    let mut ranges = Vec::new();
    let mut i = 0;
    while i < edits.len() {
        if is_equal(i) {
            i += 1;
            continue;
        }
        let start = i.saturating_sub(context);
        let mut last_change = i;
        let mut j = i + 1;
        while j < edits.len() {
            if !is_equal(j) {
                last_change = j;
                j += 1;
                continue;
            }
            let run_end = (j..edits.len()).find(|&e| !is_equal(e)).unwrap_or(edits.len());
            if run_end == edits.len() || run_end - j > 2 * context {
                break;
            }
            j = run_end;
        }
        let end = (last_change + 1 + context).min(edits.len());
        ranges.push(start..end);
        i = end;
    }
    ranges
}

// ─── Rendering ────────────────────────────────────────────────

/// Unified diff of one script. Empty when the texts are identical.
pub fn diff_one(name: &str, old: &str, new: &str, context: usize) -> Result<String> {
    if old == new {
        return Ok(String::new());
    }
    let a: Vec<&str> = old.split_inclusive('\n').collect();
    let b: Vec<&str> = new.split_inclusive('\n').collect();
    if a.len() + b.len() > MAX_DIFF_LINES {
        bail!(
            "{name}: {} lines is too large to diff (limit {MAX_DIFF_LINES})",
            a.len() + b.len()
        );
    }

    let edits = myers(&a, &b);
    let mut out = format!("--- old/{name}\n+++ new/{name}\n");
    for range in hunk_ranges(&edits, context) {
        let hunk = &edits[range];
        let old_count = hunk.iter().filter(|e| e.op != Op::Insert).count();
        let new_count = hunk.iter().filter(|e| e.op != Op::Delete).count();
        let old_start = hunk[0].old + usize::from(old_count > 0);
        let new_start = hunk[0].new + usize::from(new_count > 0);
        out.push_str(&format!(
            "@@ -{old_start},{old_count} +{new_start},{new_count} @@\n"
        ));

        for edit in hunk {
            let (prefix, line) = match edit.op {
                Op::Equal => (' ', a[edit.old]),
                Op::Delete => ('-', a[edit.old]),
                Op::Insert => ('+', b[edit.new]),
            };
            out.push(prefix);
            match line.strip_suffix('\n') {
                Some(body) => {
                    out.push_str(body);
                    out.push('\n');
                }
                None => {
                    out.push_str(line);
                    out.push('\n');
                    out.push_str(NO_NEWLINE);
                    out.push('\n');
                }
            }
        }
    }
    Ok(out)
}

// ─── Applying ─────────────────────────────────────────────────

static HUNK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").unwrap()
});

/// Apply a patch produced by [`diff_one`] to `old`.
pub fn apply(old: &str, patch: &str) -> Result<String> {
    let source: Vec<&str> = old.split_inclusive('\n').collect();
    let lines: Vec<&str> = patch.split_inclusive('\n').collect();
    let mut out = String::with_capacity(old.len());
    let mut cursor = 0usize;
    let mut i = 0usize;

    // headers
    while i < lines.len() && !lines[i].starts_with("@@") {
        i += 1;
    }

    while i < lines.len() {
        let caps = HUNK_RE
            .captures(lines[i])
            .ok_or_else(|| anyhow!("patch line {}: expected hunk header", i + 1))?;
        let count = |idx: usize| -> Result<usize> {
            caps.get(idx)
                .map_or(Ok(1), |m| m.as_str().parse().map_err(anyhow::Error::from))
        };
        let old_start: usize = caps[1].parse()?;
        let old_count = count(2)?;
        let new_count = count(4)?;
        i += 1;

        let first = if old_count == 0 {
            old_start
        } else {
            old_start.saturating_sub(1)
        };
        if first < cursor || first > source.len() {
            bail!("hunk at old line {old_start} is out of order or out of range");
        }
        for line in &source[cursor..first] {
            out.push_str(line);
        }
        cursor = first;

        let (mut seen_old, mut seen_new) = (0usize, 0usize);
        while seen_old < old_count || seen_new < new_count {
            let raw = lines
                .get(i)
                .ok_or_else(|| anyhow!("patch ends inside a hunk"))?;
            i += 1;
            let mut body = raw.get(1..).unwrap_or("").to_string();
            if lines.get(i).is_some_and(|l| l.starts_with('\\')) {
                i += 1;
                if body.ends_with('\n') {
                    body.pop();
                }
            }
            match raw.chars().next() {
                Some(' ') | Some('-') => {
                    let expected = source
                        .get(cursor)
                        .ok_or_else(|| anyhow!("patch runs past the end of the old text"))?;
                    if *expected != body {
                        bail!("patch does not apply at old line {}", cursor + 1);
                    }
                    cursor += 1;
                    seen_old += 1;
                    if raw.starts_with(' ') {
                        out.push_str(&body);
                        seen_new += 1;
                    }
                }
                Some('+') => {
                    out.push_str(&body);
                    seen_new += 1;
                }
                _ => bail!("patch line {i}: unexpected {raw:?}"),
            }
        }
    }

    for line in &source[cursor..] {
        out.push_str(line);
    }
    Ok(out)
}
