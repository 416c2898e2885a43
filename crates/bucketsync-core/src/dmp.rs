//! Character-level text diff and patch in the diff-match-patch patch format.
//!
//! The `d` operation carries its payload as standard patch text
//! (`@@ -l,s +l,s @@` hunks with `%xx`-escaped bodies), so patches survive a
//! line-delimited wire and interoperate with other diff-match-patch
//! implementations. Diffing is a Myers bisect over `char`s with common-affix
//! trimming; application locates each hunk by context, preferring the
//! position recorded in the hunk and falling back to the nearest exact match.

use std::fmt;

use crate::error::DiffError;

/// Context chars kept on each side of a hunk.
const CONTEXT_MARGIN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOp {
    Delete,
    Equal,
    Insert,
}

pub type Diff = (DiffOp, String);
pub type Diffs = Vec<Diff>;

/// One patch hunk. Offsets and lengths are in chars.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Hunk {
    pub diffs: Diffs,
    pub start1: usize,
    pub start2: usize,
    pub length1: usize,
    pub length2: usize,
}

// ── Diff ──────────────────────────────────────────────────────────────────

/// Compute the edit script turning `src` into `dst`.
pub fn diff(src: &str, dst: &str) -> Diffs {
    let a: Vec<char> = src.chars().collect();
    let b: Vec<char> = dst.chars().collect();
    let mut d = diff_slices(&a, &b);
    cleanup_merge(&mut d);
    d
}

fn diff_slices(a: &[char], b: &[char]) -> Diffs {
    if a == b {
        if a.is_empty() {
            return vec![];
        }
        return vec![(DiffOp::Equal, a.iter().collect())];
    }

    let prefix = common_prefix(a, b);
    let (a_rest, b_rest) = (&a[prefix..], &b[prefix..]);
    let suffix = common_suffix(a_rest, b_rest);
    let (a_mid, b_mid) = (
        &a_rest[..a_rest.len() - suffix],
        &b_rest[..b_rest.len() - suffix],
    );

    let mut d = Vec::new();
    if prefix > 0 {
        d.push((DiffOp::Equal, a[..prefix].iter().collect()));
    }
    d.extend(compute(a_mid, b_mid));
    if suffix > 0 {
        d.push((DiffOp::Equal, a_rest[a_rest.len() - suffix..].iter().collect()));
    }
    d
}

fn compute(a: &[char], b: &[char]) -> Diffs {
    if a.is_empty() {
        return vec![(DiffOp::Insert, b.iter().collect())];
    }
    if b.is_empty() {
        return vec![(DiffOp::Delete, a.iter().collect())];
    }

    let (long, short, a_longer) = if a.len() > b.len() { (a, b, true) } else { (b, a, false) };
    if let Some(at) = find_sub(long, short) {
        let head: String = long[..at].iter().collect();
        let tail: String = long[at + short.len()..].iter().collect();
        let op = if a_longer { DiffOp::Delete } else { DiffOp::Insert };
        return vec![
            (op, head),
            (DiffOp::Equal, short.iter().collect()),
            (op, tail),
        ];
    }
    if short.len() == 1 {
        return vec![
            (DiffOp::Delete, a.iter().collect()),
            (DiffOp::Insert, b.iter().collect()),
        ];
    }

    bisect(a, b)
}

/// Myers bisect: find a midpoint on the optimal edit path and recurse.
fn bisect(a: &[char], b: &[char]) -> Diffs {
    let n = a.len() as isize;
    let m = b.len() as isize;
    let max_d = (n + m + 1) / 2;
    let v_offset = max_d;
    let v_length = (2 * max_d + 2) as usize;
    let mut v1 = vec![-1isize; v_length];
    let mut v2 = vec![-1isize; v_length];
    v1[(v_offset + 1) as usize] = 0;
    v2[(v_offset + 1) as usize] = 0;

    let delta = n - m;
    let front = delta % 2 != 0;
    let mut k1start = 0isize;
    let mut k1end = 0isize;
    let mut k2start = 0isize;
    let mut k2end = 0isize;

    for d in 0..max_d {
        let mut k1 = -d + k1start;
        while k1 <= d - k1end {
            let k1_offset = (v_offset + k1) as usize;
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
                let k2_offset = v_offset + delta - k1;
                if k2_offset >= 0 && (k2_offset as usize) < v_length {
                    let v2o = v2[k2_offset as usize];
                    if v2o != -1 && x1 >= n - v2o {
                        return bisect_split(a, b, x1 as usize, y1 as usize);
                    }
                }
            }
            k1 += 2;
        }

        let mut k2 = -d + k2start;
        while k2 <= d - k2end {
            let k2_offset = (v_offset + k2) as usize;
            let mut x2 = if k2 == -d || (k2 != d && v2[k2_offset - 1] < v2[k2_offset + 1]) {
                v2[k2_offset + 1]
            } else {
                v2[k2_offset - 1] + 1
            };
            let mut y2 = x2 - k2;
            while x2 < n
                && y2 < m
                && a[(n - x2 - 1) as usize] == b[(m - y2 - 1) as usize]
            {
                x2 += 1;
                y2 += 1;
            }
            v2[k2_offset] = x2;
            if x2 > n {
                k2end += 2;
            } else if y2 > m {
                k2start += 2;
            } else if !front {
                let k1_offset = v_offset + delta - k2;
                if k1_offset >= 0 && (k1_offset as usize) < v_length {
                    let x1 = v1[k1_offset as usize];
                    if x1 != -1 {
                        let y1 = v_offset + x1 - k1_offset;
                        if x1 >= n - x2 {
                            return bisect_split(a, b, x1 as usize, y1 as usize);
                        }
                    }
                }
            }
            k2 += 2;
        }
    }

    vec![
        (DiffOp::Delete, a.iter().collect()),
        (DiffOp::Insert, b.iter().collect()),
    ]
}

fn bisect_split(a: &[char], b: &[char], x: usize, y: usize) -> Diffs {
    let mut d = diff_slices(&a[..x], &b[..y]);
    d.extend(diff_slices(&a[x..], &b[y..]));
    d
}

fn common_prefix(a: &[char], b: &[char]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

fn common_suffix(a: &[char], b: &[char]) -> usize {
    a.iter()
        .rev()
        .zip(b.iter().rev())
        .take_while(|(x, y)| x == y)
        .count()
}

fn find_sub(hay: &[char], needle: &[char]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    if needle.len() > hay.len() {
        return None;
    }
    hay.windows(needle.len()).position(|w| w == needle)
}

fn find_all(hay: &[char], needle: &[char]) -> Vec<usize> {
    let mut found = Vec::new();
    if needle.is_empty() || needle.len() > hay.len() {
        return found;
    }
    for (i, w) in hay.windows(needle.len()).enumerate() {
        if w == needle {
            found.push(i);
        }
    }
    found
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn chars_prefix(a: &str, b: &str) -> usize {
    a.chars().zip(b.chars()).take_while(|(x, y)| x == y).count()
}

fn chars_suffix(a: &str, b: &str) -> usize {
    a.chars()
        .rev()
        .zip(b.chars().rev())
        .take_while(|(x, y)| x == y)
        .count()
}

fn take_chars(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

fn skip_chars(s: &str, n: usize) -> String {
    s.chars().skip(n).collect()
}

/// Canonicalize an edit script: merge adjacent ops of one kind, order each
/// delete/insert cluster delete-first, and factor affixes shared by a
/// delete/insert pair into the surrounding equalities. Runs to a fixpoint.
pub(crate) fn cleanup_merge(diffs: &mut Diffs) {
    loop {
        let mut changed = false;

        let mut merged: Diffs = Vec::with_capacity(diffs.len());
        for (op, text) in diffs.drain(..) {
            if text.is_empty() {
                continue;
            }
            match merged.last_mut() {
                Some(last) if last.0 == op => last.1.push_str(&text),
                _ => merged.push((op, text)),
            }
        }

        let mut out: Diffs = Vec::with_capacity(merged.len());
        let mut del = String::new();
        let mut ins = String::new();
        let sentinel = std::iter::once((DiffOp::Equal, String::new()));
        for (op, text) in merged.into_iter().chain(sentinel) {
            match op {
                DiffOp::Delete => del.push_str(&text),
                DiffOp::Insert => ins.push_str(&text),
                DiffOp::Equal => {
                    let mut eq = text;
                    if !del.is_empty() && !ins.is_empty() {
                        let p = chars_prefix(&del, &ins);
                        if p > 0 {
                            let prefix = take_chars(&ins, p);
                            match out.last_mut() {
                                Some(last) if last.0 == DiffOp::Equal => last.1.push_str(&prefix),
                                _ => out.push((DiffOp::Equal, prefix)),
                            }
                            del = skip_chars(&del, p);
                            ins = skip_chars(&ins, p);
                            changed = true;
                        }
                        let s = chars_suffix(&del, &ins);
                        if s > 0 {
                            let keep = char_len(&ins) - s;
                            eq = format!("{}{}", skip_chars(&ins, keep), eq);
                            del = take_chars(&del, char_len(&del) - s);
                            ins = take_chars(&ins, keep);
                            changed = true;
                        }
                    }
                    if !del.is_empty() {
                        out.push((DiffOp::Delete, std::mem::take(&mut del)));
                    }
                    if !ins.is_empty() {
                        out.push((DiffOp::Insert, std::mem::take(&mut ins)));
                    }
                    if !eq.is_empty() {
                        match out.last_mut() {
                            Some(last) if last.0 == DiffOp::Equal => last.1.push_str(&eq),
                            _ => out.push((DiffOp::Equal, eq)),
                        }
                    }
                }
            }
        }

        *diffs = out;
        if !changed {
            break;
        }
    }
}

/// The pre-image of an edit script (equalities and deletions).
pub fn diff_src(diffs: &[Diff]) -> String {
    let mut txt = String::new();
    for (op, text) in diffs {
        if *op != DiffOp::Insert {
            txt.push_str(text);
        }
    }
    txt
}

/// The post-image of an edit script (equalities and insertions).
pub fn diff_dst(diffs: &[Diff]) -> String {
    let mut txt = String::new();
    for (op, text) in diffs {
        if *op != DiffOp::Delete {
            txt.push_str(text);
        }
    }
    txt
}

// ── Patch construction ────────────────────────────────────────────────────

/// Build hunks that turn `src` into `dst`.
pub fn patch_make(src: &str, dst: &str) -> Vec<Hunk> {
    let diffs = diff(src, dst);
    patch_from_diffs(src, &diffs)
}

/// Build hunks from a precomputed edit script over `src`.
pub fn patch_from_diffs(src: &str, diffs: &[Diff]) -> Vec<Hunk> {
    let mut patches = Vec::new();
    if diffs.iter().all(|(op, _)| *op == DiffOp::Equal) {
        return patches;
    }

    let mut patch = Hunk::default();
    let mut char_count1 = 0usize;
    let mut char_count2 = 0usize;
    // prepatch tracks the source as of the last emitted hunk; postpatch has
    // all edits so far applied and becomes the next hunk's context source.
    let mut prepatch: Vec<char> = src.chars().collect();
    let mut postpatch: Vec<char> = prepatch.clone();

    for (i, (op, text)) in diffs.iter().enumerate() {
        let tlen = char_len(text);
        if patch.diffs.is_empty() && *op != DiffOp::Equal {
            patch.start1 = char_count1;
            patch.start2 = char_count2;
        }
        match op {
            DiffOp::Insert => {
                patch.diffs.push((*op, text.clone()));
                patch.length2 += tlen;
                postpatch.splice(char_count2..char_count2, text.chars());
            }
            DiffOp::Delete => {
                patch.diffs.push((*op, text.clone()));
                patch.length1 += tlen;
                postpatch.splice(char_count2..char_count2 + tlen, std::iter::empty());
            }
            DiffOp::Equal => {
                if tlen <= 2 * CONTEXT_MARGIN && !patch.diffs.is_empty() && i != diffs.len() - 1 {
                    patch.diffs.push((*op, text.clone()));
                    patch.length1 += tlen;
                    patch.length2 += tlen;
                } else if tlen >= 2 * CONTEXT_MARGIN && !patch.diffs.is_empty() {
                    add_context(&mut patch, &prepatch);
                    patches.push(std::mem::take(&mut patch));
                    prepatch = postpatch.clone();
                    char_count1 = char_count2;
                }
            }
        }
        if *op != DiffOp::Insert {
            char_count1 += tlen;
        }
        if *op != DiffOp::Delete {
            char_count2 += tlen;
        }
    }
    if !patch.diffs.is_empty() {
        add_context(&mut patch, &prepatch);
        patches.push(patch);
    }
    patches
}

/// Grow a hunk's equal context until its pre-image is unique in `text`.
fn add_context(patch: &mut Hunk, text: &[char]) {
    if text.is_empty() {
        return;
    }
    let mut pattern: Vec<char> = text[patch.start2..patch.start2 + patch.length1].to_vec();
    let mut padding = 0usize;
    while !pattern.is_empty()
        && find_all(text, &pattern).len() > 1
        && padding < CONTEXT_MARGIN * 8
    {
        padding += CONTEXT_MARGIN;
        let from = patch.start2.saturating_sub(padding);
        let to = (patch.start2 + patch.length1 + padding).min(text.len());
        pattern = text[from..to].to_vec();
    }
    padding += CONTEXT_MARGIN;

    let prefix_from = patch.start2.saturating_sub(padding);
    let prefix: String = text[prefix_from..patch.start2].iter().collect();
    if !prefix.is_empty() {
        patch.diffs.insert(0, (DiffOp::Equal, prefix.clone()));
    }
    let suffix_to = (patch.start2 + patch.length1 + padding).min(text.len());
    let suffix: String = text[patch.start2 + patch.length1..suffix_to].iter().collect();
    if !suffix.is_empty() {
        patch.diffs.push((DiffOp::Equal, suffix.clone()));
    }

    let plen = char_len(&prefix);
    let slen = char_len(&suffix);
    patch.start1 -= plen;
    patch.start2 -= plen;
    patch.length1 += plen + slen;
    patch.length2 += plen + slen;
}

// ── Patch text round-trip ─────────────────────────────────────────────────

impl fmt::Display for Hunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let coords1 = match self.length1 {
            0 => format!("{},0", self.start1),
            1 => format!("{}", self.start1 + 1),
            n => format!("{},{}", self.start1 + 1, n),
        };
        let coords2 = match self.length2 {
            0 => format!("{},0", self.start2),
            1 => format!("{}", self.start2 + 1),
            n => format!("{},{}", self.start2 + 1, n),
        };
        writeln!(f, "@@ -{coords1} +{coords2} @@")?;
        for (op, text) in &self.diffs {
            let sign = match op {
                DiffOp::Insert => '+',
                DiffOp::Delete => '-',
                DiffOp::Equal => ' ',
            };
            writeln!(f, "{sign}{}", encode_uri(text))?;
        }
        Ok(())
    }
}

/// Serialize hunks to patch text.
pub fn patch_to_text(patches: &[Hunk]) -> String {
    let mut out = String::new();
    for p in patches {
        out.push_str(&p.to_string());
    }
    out
}

/// Parse patch text into hunks.
pub fn patch_from_text(text: &str) -> Result<Vec<Hunk>, DiffError> {
    let mut patches = Vec::new();
    let mut lines = text.split('\n').peekable();
    while let Some(line) = lines.next() {
        if line.is_empty() {
            continue;
        }
        let (start1, length1, start2, length2) = parse_header(line)?;
        let mut hunk = Hunk {
            start1,
            start2,
            length1,
            length2,
            diffs: Vec::new(),
        };
        while let Some(body) = lines.peek() {
            if body.starts_with("@@") {
                break;
            }
            let body = lines.next().unwrap_or_default();
            if body.is_empty() {
                continue;
            }
            let mut chars = body.chars();
            let sign = chars.next().unwrap_or(' ');
            let decoded = decode_uri(chars.as_str())?;
            let op = match sign {
                '+' => DiffOp::Insert,
                '-' => DiffOp::Delete,
                ' ' => DiffOp::Equal,
                other => {
                    return Err(DiffError::MalformedOperation(format!(
                        "bad patch line sign {other:?}"
                    )))
                }
            };
            hunk.diffs.push((op, decoded));
        }
        patches.push(hunk);
    }
    Ok(patches)
}

fn parse_header(line: &str) -> Result<(usize, usize, usize, usize), DiffError> {
    let malformed = || DiffError::MalformedOperation(format!("bad patch header {line:?}"));
    let inner = line
        .strip_prefix("@@ -")
        .and_then(|s| s.strip_suffix(" @@"))
        .ok_or_else(malformed)?;
    let (c1, c2) = inner.split_once(" +").ok_or_else(malformed)?;
    let parse = |coords: &str| -> Result<(usize, usize), DiffError> {
        match coords.split_once(',') {
            Some((s, l)) => {
                let start: usize = s.parse().map_err(|_| malformed())?;
                let len: usize = l.parse().map_err(|_| malformed())?;
                if len == 0 {
                    Ok((start, 0))
                } else {
                    Ok((start.checked_sub(1).ok_or_else(malformed)?, len))
                }
            }
            None => {
                let start: usize = coords.parse().map_err(|_| malformed())?;
                Ok((start.checked_sub(1).ok_or_else(malformed)?, 1))
            }
        }
    };
    let (start1, length1) = parse(c1)?;
    let (start2, length2) = parse(c2)?;
    Ok((start1, length1, start2, length2))
}

// ── Patch application ─────────────────────────────────────────────────────

/// Apply hunks to `text`. Returns the patched text and a per-hunk success
/// flag; a failed hunk leaves the text untouched at that position.
pub fn patch_apply(patches: &[Hunk], text: &str) -> (String, Vec<bool>) {
    let mut chars: Vec<char> = text.chars().collect();
    let mut results = Vec::with_capacity(patches.len());
    let mut delta: isize = 0;

    for patch in patches {
        let expected = patch.start2 as isize + delta;
        let src: Vec<char> = diff_src(&patch.diffs).chars().collect();
        let dst: Vec<char> = diff_dst(&patch.diffs).chars().collect();

        let at = if src.is_empty() {
            Some(expected.clamp(0, chars.len() as isize) as usize)
        } else {
            let candidates = find_all(&chars, &src);
            candidates
                .into_iter()
                .min_by_key(|&p| (p as isize - expected).abs())
        };

        match at {
            None => results.push(false),
            Some(at) => {
                delta += at as isize - expected;
                chars.splice(at..at + src.len(), dst.iter().cloned());
                results.push(true);
            }
        }
    }

    (chars.into_iter().collect(), results)
}

// ── String-level conveniences used by the operation algebra ───────────────

/// Patch text that rewrites `src` into `dst`; empty when the strings match.
pub fn make_patch(src: &str, dst: &str) -> String {
    patch_to_text(&patch_make(src, dst))
}

/// Apply patch text, requiring every hunk to land.
pub fn apply_patch(patch_text: &str, text: &str) -> Result<String, DiffError> {
    let patches = patch_from_text(patch_text)?;
    let (result, flags) = patch_apply(&patches, text);
    if flags.iter().all(|ok| *ok) {
        Ok(result)
    } else {
        Err(DiffError::PreconditionViolated(
            "text patch did not apply cleanly".into(),
        ))
    }
}

/// Rebase `local` (a patch against `base`) onto the result of applying
/// `upstream` to `base`. Returns `None` when the rebase is not conflict-free;
/// returns an empty string when the rebased edit is a no-op.
pub fn transform(local: &str, upstream: &str, base: &str) -> Option<String> {
    let up = patch_from_text(upstream).ok()?;
    let (shifted_base, flags) = patch_apply(&up, base);
    if !flags.iter().all(|ok| *ok) {
        return None;
    }
    let local_patches = patch_from_text(local).ok()?;
    let (merged, flags) = patch_apply(&local_patches, &shifted_base);
    if !flags.iter().all(|ok| *ok) {
        return None;
    }
    if merged == shifted_base {
        return Some(String::new());
    }
    Some(make_patch(&shifted_base, &merged))
}

// ── Percent escaping ──────────────────────────────────────────────────────

fn encode_uri(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for b in text.bytes() {
        let keep = b.is_ascii_alphanumeric()
            || matches!(
                b,
                b';' | b','
                    | b'/'
                    | b'?'
                    | b':'
                    | b'@'
                    | b'&'
                    | b'='
                    | b'+'
                    | b'$'
                    | b'-'
                    | b'_'
                    | b'.'
                    | b'!'
                    | b'~'
                    | b'*'
                    | b'\''
                    | b'('
                    | b')'
                    | b'#'
            );
        if keep {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

fn decode_uri(text: &str) -> Result<String, DiffError> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| {
                    DiffError::MalformedOperation("bad percent escape in patch".into())
                })?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out)
        .map_err(|_| DiffError::MalformedOperation("patch body is not valid UTF-8".into()))
}
