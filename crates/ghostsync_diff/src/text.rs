//! Character-level text diffs in delta encoding.
//!
//! A text delta is a tab-separated list of runs over the source string:
//!
//! - `=N` keeps `N` characters,
//! - `-N` deletes `N` characters,
//! - `+text` inserts `text`, escaped the way `encodeURI` escapes it with
//!   spaces left literal.
//!
//! A delta always spans its whole source, so `"AC"` to `"ACD"` is `=2\t+D`.
//! Lengths count Unicode scalar values (Rust `char`s).
//!
//! The diff itself is Myers' O(ND) algorithm with the middle-snake bisection,
//! run after stripping the common prefix and suffix.

use crate::error::{DiffError, DiffResult};
use std::cmp::Ordering;

/// One run of a parsed text delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextOp {
    /// Keep this many source characters.
    Retain(usize),
    /// Insert text.
    Insert(String),
    /// Drop this many source characters.
    Delete(usize),
}

impl TextOp {
    /// Number of source characters this run consumes.
    pub fn src_len(&self) -> usize {
        match self {
            TextOp::Retain(n) | TextOp::Delete(n) => *n,
            TextOp::Insert(_) => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edit {
    Equal,
    Insert,
    Delete,
}

type Chunk = (Edit, Vec<char>);

/// Computes the delta that turns `src` into `dst`.
///
/// Returns `None` when the strings are equal.
pub fn text_diff(src: &str, dst: &str) -> Option<String> {
    if src == dst {
        return None;
    }
    let a: Vec<char> = src.chars().collect();
    let b: Vec<char> = dst.chars().collect();
    let chunks = diff_chars(&a, &b);
    if chunks.iter().all(|(edit, _)| *edit == Edit::Equal) {
        return None;
    }
    Some(to_delta(&chunks_to_ops(chunks)))
}

/// Applies a delta to `src`.
///
/// Fails when the delta does not parse or does not span exactly `src`.
pub fn apply_text_delta(src: &str, delta: &str) -> DiffResult<String> {
    let ops = parse_delta(delta)?;
    apply_ops(src, &ops)
}

/// Applies parsed runs to `src`.
pub fn apply_ops(src: &str, ops: &[TextOp]) -> DiffResult<String> {
    let chars: Vec<char> = src.chars().collect();
    let spanned = ops
        .iter()
        .try_fold(0usize, |total, op| total.checked_add(op.src_len()))
        .ok_or_else(|| DiffError::invalid_text_delta("delta run lengths overflow"))?;
    if spanned != chars.len() {
        return Err(DiffError::invalid_text_delta(format!(
            "delta spans {spanned} chars, source has {}",
            chars.len()
        )));
    }

    let mut out = String::with_capacity(src.len());
    let mut pos = 0usize;
    for op in ops {
        match op {
            TextOp::Retain(n) => {
                out.extend(&chars[pos..pos + n]);
                pos += n;
            }
            TextOp::Delete(n) => pos += n,
            TextOp::Insert(text) => out.push_str(text),
        }
    }
    Ok(out)
}

/// Parses a delta string into runs.
pub fn parse_delta(delta: &str) -> DiffResult<Vec<TextOp>> {
    let mut ops = Vec::new();
    for token in delta.split('\t').filter(|t| !t.is_empty()) {
        let mut chars = token.chars();
        let kind = chars.next();
        let rest = chars.as_str();
        match kind {
            Some('+') => ops.push(TextOp::Insert(decode_uri(rest)?)),
            Some(run @ ('=' | '-')) => {
                let n: usize = rest.parse().map_err(|_| {
                    DiffError::invalid_text_delta(format!("invalid run length in {token:?}"))
                })?;
                ops.push(if run == '=' {
                    TextOp::Retain(n)
                } else {
                    TextOp::Delete(n)
                });
            }
            _ => {
                return Err(DiffError::invalid_text_delta(format!(
                    "invalid operation in {token:?}"
                )))
            }
        }
    }
    Ok(ops)
}

/// Encodes runs as a delta string.
pub fn to_delta(ops: &[TextOp]) -> String {
    ops.iter()
        .filter(|op| !matches!(op, TextOp::Retain(0) | TextOp::Delete(0)))
        .filter(|op| !matches!(op, TextOp::Insert(s) if s.is_empty()))
        .map(|op| match op {
            TextOp::Retain(n) => format!("={n}"),
            TextOp::Delete(n) => format!("-{n}"),
            TextOp::Insert(text) => format!("+{}", encode_uri(text)),
        })
        .collect::<Vec<_>>()
        .join("\t")
}

/// Rewrites `op` so it applies after `against`, where both were computed
/// against the same source text.
///
/// Concurrent inserts at the same position are ordered by comparing the
/// inserted text, so `transform(a, b)` and `transform(b, a)` converge.
pub fn transform_ops(op: &[TextOp], against: &[TextOp]) -> Vec<TextOp> {
    let mut out: Vec<TextOp> = Vec::new();
    let mut ops = op.iter().cloned();
    let mut ags = against.iter().cloned();
    let mut cur_op = ops.next();
    let mut cur_ag = ags.next();

    loop {
        match (cur_op.take(), cur_ag.take()) {
            (None, None) => break,
            (Some(TextOp::Insert(s)), Some(TextOp::Insert(t))) => {
                if s.cmp(&t) != Ordering::Greater {
                    push_op(&mut out, TextOp::Insert(s));
                    cur_op = ops.next();
                    cur_ag = Some(TextOp::Insert(t));
                } else {
                    push_op(&mut out, TextOp::Retain(t.chars().count()));
                    cur_op = Some(TextOp::Insert(s));
                    cur_ag = ags.next();
                }
            }
            (Some(TextOp::Insert(s)), ag) => {
                push_op(&mut out, TextOp::Insert(s));
                cur_op = ops.next();
                cur_ag = ag;
            }
            (o, Some(TextOp::Insert(t))) => {
                push_op(&mut out, TextOp::Retain(t.chars().count()));
                cur_op = o;
                cur_ag = ags.next();
            }
            (Some(o), Some(a)) => {
                let n = o.src_len().min(a.src_len());
                match (&o, &a) {
                    (TextOp::Retain(_), TextOp::Retain(_)) => push_op(&mut out, TextOp::Retain(n)),
                    (TextOp::Delete(_), TextOp::Retain(_)) => push_op(&mut out, TextOp::Delete(n)),
                    // the other side already removed these characters
                    _ => {}
                }
                cur_op = shrink(o, n).or_else(|| ops.next());
                cur_ag = shrink(a, n).or_else(|| ags.next());
            }
            (Some(o), None) => {
                push_op(&mut out, o);
                cur_op = ops.next();
            }
            (None, Some(_)) => {
                cur_ag = ags.next();
            }
        }
    }
    out
}

fn shrink(op: TextOp, by: usize) -> Option<TextOp> {
    match op {
        TextOp::Retain(n) if n > by => Some(TextOp::Retain(n - by)),
        TextOp::Delete(n) if n > by => Some(TextOp::Delete(n - by)),
        _ => None,
    }
}

fn push_op(ops: &mut Vec<TextOp>, op: TextOp) {
    match (ops.last_mut(), &op) {
        (_, TextOp::Retain(0) | TextOp::Delete(0)) => {}
        (Some(TextOp::Retain(n)), TextOp::Retain(m)) => *n += m,
        (Some(TextOp::Delete(n)), TextOp::Delete(m)) => *n += m,
        (Some(TextOp::Insert(s)), TextOp::Insert(t)) => s.push_str(t),
        _ => ops.push(op),
    }
}

fn chunks_to_ops(chunks: Vec<Chunk>) -> Vec<TextOp> {
    let mut ops = Vec::with_capacity(chunks.len());
    for (edit, text) in chunks {
        let op = match edit {
            Edit::Equal => TextOp::Retain(text.len()),
            Edit::Delete => TextOp::Delete(text.len()),
            Edit::Insert => TextOp::Insert(text.into_iter().collect()),
        };
        push_op(&mut ops, op);
    }
    ops
}

// ── Myers diff ────────────────────────────────────────────────────────────

fn diff_chars(a: &[char], b: &[char]) -> Vec<Chunk> {
    if a == b {
        return if a.is_empty() {
            Vec::new()
        } else {
            vec![(Edit::Equal, a.to_vec())]
        };
    }

    let prefix = common_prefix(a, b);
    let (a_rest, b_rest) = (&a[prefix..], &b[prefix..]);
    let suffix = common_suffix(a_rest, b_rest);
    let a_mid = &a_rest[..a_rest.len() - suffix];
    let b_mid = &b_rest[..b_rest.len() - suffix];

    let mut chunks = Vec::new();
    if prefix > 0 {
        chunks.push((Edit::Equal, a[..prefix].to_vec()));
    }
    chunks.extend(diff_middle(a_mid, b_mid));
    if suffix > 0 {
        chunks.push((Edit::Equal, a_rest[a_rest.len() - suffix..].to_vec()));
    }
    merge_chunks(chunks)
}

fn diff_middle(a: &[char], b: &[char]) -> Vec<Chunk> {
    if a.is_empty() {
        return vec![(Edit::Insert, b.to_vec())];
    }
    if b.is_empty() {
        return vec![(Edit::Delete, a.to_vec())];
    }

    let (long, short, a_is_long) = if a.len() > b.len() {
        (a, b, true)
    } else {
        (b, a, false)
    };
    if let Some(at) = find(long, short) {
        let edit = if a_is_long { Edit::Delete } else { Edit::Insert };
        let mut chunks = Vec::with_capacity(3);
        if at > 0 {
            chunks.push((edit, long[..at].to_vec()));
        }
        chunks.push((Edit::Equal, short.to_vec()));
        if at + short.len() < long.len() {
            chunks.push((edit, long[at + short.len()..].to_vec()));
        }
        return chunks;
    }

    if short.len() == 1 {
        return vec![(Edit::Delete, a.to_vec()), (Edit::Insert, b.to_vec())];
    }

    bisect(a, b)
}

fn bisect(a: &[char], b: &[char]) -> Vec<Chunk> {
    let n = a.len() as isize;
    let m = b.len() as isize;
    let max_d = (n + m + 1) / 2;
    let offset = max_d;
    let width = 2 * max_d + 2;
    let mut v1 = vec![-1isize; width as usize];
    let mut v2 = vec![-1isize; width as usize];
    v1[(offset + 1) as usize] = 0;
    v2[(offset + 1) as usize] = 0;
    let delta = n - m;
    let front = delta % 2 != 0;
    let (mut k1start, mut k1end, mut k2start, mut k2end) = (0isize, 0isize, 0isize, 0isize);

    for d in 0..max_d {
        let mut k1 = -d + k1start;
        while k1 <= d - k1end {
            let k1_offset = (offset + k1) as usize;
            let mut x1 = if k1 == -d || (k1 != d && v1[k1_offset - 1] < v1[k1_offset + 1]) {
                v1[k1_offset + 1]
            } else {
                v1[k1_offset - 1] + 1
            };
            let mut y1 = x1 - k1;
            while x1 < n && y1 < m && a[x1 as usize] == b[y1 as usize] {
                x1 += 1;
                y1 += 1;
            }
            v1[k1_offset] = x1;
            if x1 > n {
                k1end += 2;
            } else if y1 > m {
                k1start += 2;
            } else if front {
                let k2_offset = offset + delta - k1;
                if (0..width).contains(&k2_offset) && v2[k2_offset as usize] != -1 {
                    let x2 = n - v2[k2_offset as usize];
                    if x1 >= x2 {
                        return bisect_split(a, b, x1 as usize, y1 as usize);
                    }
                }
            }
            k1 += 2;
        }

        let mut k2 = -d + k2start;
        while k2 <= d - k2end {
            let k2_offset = (offset + k2) as usize;
            let mut x2 = if k2 == -d || (k2 != d && v2[k2_offset - 1] < v2[k2_offset + 1]) {
                v2[k2_offset + 1]
            } else {
                v2[k2_offset - 1] + 1
            };
            let mut y2 = x2 - k2;
            while x2 < n && y2 < m && a[(n - x2 - 1) as usize] == b[(m - y2 - 1) as usize] {
                x2 += 1;
                y2 += 1;
            }
            v2[k2_offset] = x2;
            if x2 > n {
                k2end += 2;
            } else if y2 > m {
                k2start += 2;
            } else if !front {
                let k1_offset = offset + delta - k2;
                if (0..width).contains(&k1_offset) && v1[k1_offset as usize] != -1 {
                    let x1 = v1[k1_offset as usize];
                    let y1 = offset + x1 - k1_offset;
                    if x1 >= n - x2 {
                        return bisect_split(a, b, x1 as usize, y1 as usize);
                    }
                }
            }
            k2 += 2;
        }
    }

    vec![(Edit::Delete, a.to_vec()), (Edit::Insert, b.to_vec())]
}

fn bisect_split(a: &[char], b: &[char], x: usize, y: usize) -> Vec<Chunk> {
    let mut chunks = diff_chars(&a[..x], &b[..y]);
    chunks.extend(diff_chars(&a[x..], &b[y..]));
    chunks
}

fn merge_chunks(chunks: Vec<Chunk>) -> Vec<Chunk> {
    let mut merged: Vec<Chunk> = Vec::with_capacity(chunks.len());
    for (edit, text) in chunks {
        if text.is_empty() {
            continue;
        }
        match merged.last_mut() {
            Some((last, buf)) if *last == edit => buf.extend(text),
            _ => merged.push((edit, text)),
        }
    }
    merged
}

fn common_prefix(a: &[char], b: &[char]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

fn common_suffix(a: &[char], b: &[char]) -> usize {
    a.iter()
        .rev()
        .zip(b.iter().rev())
        .take_while(|(x, y)| x == y)
        .count()
}

fn find(haystack: &[char], needle: &[char]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

// ── Insert escaping ───────────────────────────────────────────────────────

fn is_uri_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || " -_.!~*'();/?:@&=+$,#".contains(c)
}

fn encode_uri(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut buf = [0u8; 4];
    for c in text.chars() {
        if is_uri_safe(c) {
            out.push(c);
        } else {
            for byte in c.encode_utf8(&mut buf).bytes() {
                out.push_str(&format!("%{byte:02X}"));
            }
        }
    }
    out
}

fn decode_uri(text: &str) -> DiffResult<String> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = text
                .get(i + 1..i + 3)
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| DiffError::invalid_text_delta("malformed percent escape"))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| DiffError::invalid_text_delta("escape is not valid UTF-8"))
}
