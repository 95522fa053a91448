//! Byte-level scanners for marker bodies.
//!
//! Every delimiter the scanners look for is ASCII, so each index they return
//! is a valid `str` slice boundary.

use crate::marker::{DASHBOARD_PREFIX, Marker, RENDER_PREFIX, parse_dashboard, parse_render};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MarkerKind {
    Dashboard,
    Render,
}

impl MarkerKind {
    pub(crate) fn prefix(self) -> &'static str {
        match self {
            MarkerKind::Dashboard => DASHBOARD_PREFIX,
            MarkerKind::Render => RENDER_PREFIX,
        }
    }
}

/// Result of examining a candidate marker that starts at offset 0.
#[derive(Debug, PartialEq)]
pub(crate) enum Scan {
    /// The input ends before the marker could be confirmed or rejected.
    Incomplete,
    /// A well-formed marker spanning `len` bytes.
    Complete { marker: Marker, len: usize },
    /// Not a marker; the first `len` bytes must be shown as text.
    Malformed { len: usize },
}

/// Leftmost marker prefix in `text`, as `(offset, kind)`.
pub(crate) fn find_prefix(text: &str) -> Option<(usize, MarkerKind)> {
    let dashboard = text
        .find(DASHBOARD_PREFIX)
        .map(|i| (i, MarkerKind::Dashboard));
    let render = text.find(RENDER_PREFIX).map(|i| (i, MarkerKind::Render));
    match (dashboard, render) {
        (Some(d), Some(r)) => Some(if d.0 <= r.0 { d } else { r }),
        (d, r) => d.or(r),
    }
}

/// Length of the longest suffix of `text` that is a strict prefix of either
/// marker literal.
pub(crate) fn partial_prefix_len(text: &str) -> usize {
    let bytes = text.as_bytes();
    let longest = DASHBOARD_PREFIX.len().max(RENDER_PREFIX.len()) - 1;
    for len in (1..=longest.min(bytes.len())).rev() {
        let tail = &bytes[bytes.len() - len..];
        if is_strict_prefix(tail, DASHBOARD_PREFIX) || is_strict_prefix(tail, RENDER_PREFIX) {
            return len;
        }
    }
    0
}

fn is_strict_prefix(tail: &[u8], literal: &str) -> bool {
    tail.len() < literal.len() && literal.as_bytes().starts_with(tail)
}

/// Examine the marker of `kind` whose prefix starts at `text[0]`.
pub(crate) fn scan_marker(text: &str, kind: MarkerKind) -> Scan {
    match kind {
        MarkerKind::Dashboard => scan_dashboard(text),
        MarkerKind::Render => scan_render(text),
    }
}

fn scan_dashboard(text: &str) -> Scan {
    let bytes = text.as_bytes();
    let body_start = DASHBOARD_PREFIX.len();
    match bytes.get(body_start) {
        None => Scan::Incomplete,
        Some(b'{') => scan_object_then_close(text, body_start, parse_dashboard),
        Some(_) => Scan::Malformed { len: body_start },
    }
}

fn scan_render(text: &str) -> Scan {
    let bytes = text.as_bytes();
    let name_start = RENDER_PREFIX.len();

    let mut colon = name_start;
    loop {
        match bytes.get(colon) {
            None => return Scan::Incomplete,
            Some(b':') => break,
            Some(b']' | b'[' | b'\n' | b'\r') => return Scan::Malformed { len: colon },
            Some(_) => colon += 1,
        }
    }
    if colon == name_start {
        return Scan::Malformed { len: colon + 1 };
    }

    let component = &text[name_start..colon];
    let value_start = colon + 1;
    match bytes.get(value_start) {
        None => Scan::Incomplete,
        Some(b'{') => scan_object_then_close(text, value_start, |body| {
            parse_render(component, body)
        }),
        Some(_) => match find_unnested_close(bytes, value_start) {
            None => Scan::Incomplete,
            Some(close) => match parse_render(component, &text[value_start..close]) {
                Some(marker) => Scan::Complete {
                    marker,
                    len: close + 1,
                },
                None => Scan::Malformed { len: close + 1 },
            },
        },
    }
}

/// Scan a `{...}` body starting at `start`, require `]` right after it, and
/// hand the body to `parse`.
fn scan_object_then_close(
    text: &str,
    start: usize,
    parse: impl FnOnce(&str) -> Option<Marker>,
) -> Scan {
    let bytes = text.as_bytes();
    let Some(end) = balanced_object_end(bytes, start) else {
        return Scan::Incomplete;
    };
    match bytes.get(end) {
        None => Scan::Incomplete,
        Some(b']') => match parse(&text[start..end]) {
            Some(marker) => Scan::Complete {
                marker,
                len: end + 1,
            },
            None => Scan::Malformed { len: end + 1 },
        },
        Some(_) => Scan::Malformed { len: end },
    }
}

/// Index just past the `}` that balances the `{` at `start`.
///
/// Braces inside double-quoted strings are ignored, honoring backslash escapes.
fn balanced_object_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Index of the first `]` at nesting depth zero, starting at `start`.
fn find_unnested_close(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'[' | b'{' => depth += 1,
            b'}' => depth = depth.saturating_sub(1),
            b']' if depth == 0 => return Some(i),
            b']' => depth -= 1,
            _ => {}
        }
    }
    None
}
