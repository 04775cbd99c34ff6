/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Hostlist expressions.
//!
//! The cluster convention writes node sets as `prefix[lo-hi,...]`, e.g.
//! `tux[0-3,7]` for `tux0 tux1 tux2 tux3 tux7`.  This module converts
//! between that textual form, plain host name lists, and node
//! [`Bitmap`]s over the global [`NodeTable`].

use thiserror::Error;

use crate::bitmap::Bitmap;
use crate::node::NodeTable;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HostlistError {
    /// A bracket expression did not parse.
    #[error("malformed hostlist expression: '{0}'")]
    Malformed(String),

    /// An expanded host name is not in the node table.
    #[error("unknown host: '{0}'")]
    UnknownHost(String),
}

/// Expand a hostlist expression into individual host names, preserving
/// order and repetitions.
///
/// Repetitions matter: the `ARBITRARY` task distribution names the host
/// of every task, so `"tux0,tux0,tux1"` means two tasks on `tux0`.
pub fn expand(expr: &str) -> Result<Vec<String>, HostlistError> {
    let mut out = Vec::new();
    for part in split_outside_brackets(expr)? {
        match part.find('[') {
            None => {
                if part.is_empty() {
                    return Err(HostlistError::Malformed(expr.to_string()));
                }
                out.push(part);
            }
            Some(open) => {
                if !part.ends_with(']') {
                    return Err(HostlistError::Malformed(part));
                }
                let prefix = &part[..open];
                let body = &part[open + 1..part.len() - 1];
                for seg in body.split(',') {
                    let (lo, hi, width) = parse_segment(seg)
                        .ok_or_else(|| HostlistError::Malformed(part.clone()))?;
                    for n in lo..=hi {
                        out.push(format!("{prefix}{n:0width$}"));
                    }
                }
            }
        }
    }
    Ok(out)
}

/// Parse a hostlist expression into a node bitmap.
pub fn parse(expr: &str, table: &NodeTable) -> Result<Bitmap, HostlistError> {
    let mut map = Bitmap::new(table.len());
    for host in expand(expr)? {
        let inx = table
            .lookup(&host)
            .ok_or(HostlistError::UnknownHost(host))?;
        map.set(inx);
    }
    Ok(map)
}

/// Compress a node bitmap into the ranged `prefix[lo-hi,...]` form.
///
/// Hosts whose names carry no trailing number, or whose neighbours use a
/// different prefix, are emitted verbatim.
pub fn ranged_string(map: &Bitmap, table: &NodeTable) -> String {
    // (prefix, number, width) per set node, in index order
    let mut parts: Vec<(String, Option<(u64, usize)>)> = Vec::new();
    for inx in map.iter_set() {
        parts.push(split_name(table.name(inx)));
    }

    let mut out = String::new();
    let mut i = 0;
    while i < parts.len() {
        match &parts[i].1 {
            None => {
                push_part(&mut out, &parts[i].0);
                i += 1;
            }
            Some((first, width)) => {
                let prefix = parts[i].0.clone();
                let (first, width) = (*first, *width);
                let mut runs: Vec<(u64, u64)> = vec![(first, first)];
                let mut j = i + 1;
                while j < parts.len() {
                    match &parts[j] {
                        (p, Some((n, w))) if *p == prefix && *w == width => {
                            match runs.last_mut() {
                                Some(last) if *n == last.1 + 1 => last.1 = *n,
                                _ => runs.push((*n, *n)),
                            }
                            j += 1;
                        }
                        _ => break,
                    }
                }
                if j == i + 1 {
                    // lone host, no bracket needed
                    push_part(&mut out, &format!("{prefix}{first:0width$}"));
                } else {
                    use std::fmt::Write as _;
                    let mut body = String::new();
                    for (lo, hi) in &runs {
                        if !body.is_empty() {
                            body.push(',');
                        }
                        if lo == hi {
                            let _ = write!(body, "{lo:0width$}");
                        } else {
                            let _ = write!(body, "{lo:0width$}-{hi:0width$}");
                        }
                    }
                    push_part(&mut out, &format!("{prefix}[{body}]"));
                }
                i = j;
            }
        }
    }
    out
}

fn push_part(out: &mut String, part: &str) {
    if !out.is_empty() {
        out.push(',');
    }
    out.push_str(part);
}

/// Split `"tux007"` into `("tux", Some((7, 3)))`; names without a
/// numeric suffix return `(name, None)`.
fn split_name(name: &str) -> (String, Option<(u64, usize)>) {
    let digits = name.chars().rev().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return (name.to_string(), None);
    }
    let split = name.len() - digits;
    let num = name[split..].parse::<u64>().ok();
    match num {
        Some(n) => (name[..split].to_string(), Some((n, digits))),
        None => (name.to_string(), None),
    }
}

/// Split a comma-separated expression, treating bracketed segments as
/// atomic.
fn split_outside_brackets(expr: &str) -> Result<Vec<String>, HostlistError> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut cur = String::new();
    for c in expr.chars() {
        match c {
            '[' => {
                depth += 1;
                cur.push(c);
            }
            ']' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| HostlistError::Malformed(expr.to_string()))?;
                cur.push(c);
            }
            ',' if depth == 0 => {
                parts.push(std::mem::take(&mut cur));
            }
            _ => cur.push(c),
        }
    }
    if depth != 0 {
        return Err(HostlistError::Malformed(expr.to_string()));
    }
    parts.push(cur);
    Ok(parts)
}

/// One `lo`, `lo-hi` segment of a bracket body; returns the zero-pad
/// width taken from the `lo` spelling.
fn parse_segment(seg: &str) -> Option<(u64, u64, usize)> {
    match seg.split_once('-') {
        Some((a, b)) => {
            let lo = a.parse::<u64>().ok()?;
            let hi = b.parse::<u64>().ok()?;
            if lo > hi {
                return None;
            }
            Some((lo, hi, a.len()))
        }
        None => {
            let v = seg.parse::<u64>().ok()?;
            Some((v, v, seg.len()))
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeInfo;

    fn table() -> NodeTable {
        NodeTable::new((0..8).map(|i| NodeInfo::new(format!("tux{i}"), 4)).collect())
    }

    #[test]
    fn expand_plain_list() {
        assert_eq!(expand("tux0,tux3").unwrap(), vec!["tux0", "tux3"]);
    }

    #[test]
    fn expand_bracket_ranges() {
        assert_eq!(
            expand("tux[0-2,5]").unwrap(),
            vec!["tux0", "tux1", "tux2", "tux5"]
        );
    }

    #[test]
    fn expand_preserves_repetitions() {
        assert_eq!(expand("tux0,tux0,tux1").unwrap(), vec!["tux0", "tux0", "tux1"]);
    }

    #[test]
    fn expand_keeps_zero_padding() {
        assert_eq!(expand("n[008-010]").unwrap(), vec!["n008", "n009", "n010"]);
    }

    #[test]
    fn expand_rejects_malformed() {
        assert!(expand("tux[0-").is_err());
        assert!(expand("tux[2-0]").is_err());
        assert!(expand("tux]0[").is_err());
    }

    #[test]
    fn parse_to_bitmap() {
        let t = table();
        let map = parse("tux[1-3],tux6", &t).unwrap();
        assert_eq!(map.fmt_ranges(), "1-3,6");
    }

    #[test]
    fn parse_unknown_host_errors() {
        let t = table();
        assert_eq!(
            parse("zebra9", &t),
            Err(HostlistError::UnknownHost("zebra9".into()))
        );
    }

    #[test]
    fn ranged_string_compresses_runs() {
        let t = table();
        let mut map = Bitmap::new(t.len());
        map.set_range(0, 2);
        map.set(5);
        assert_eq!(ranged_string(&map, &t), "tux[0-2,5]");
    }

    #[test]
    fn ranged_string_single_host_is_plain() {
        let t = table();
        let mut map = Bitmap::new(t.len());
        map.set(4);
        assert_eq!(ranged_string(&map, &t), "tux4");
    }

    #[test]
    fn parse_round_trips_ranged_string() {
        let t = table();
        let mut map = Bitmap::new(t.len());
        map.set(0);
        map.set(1);
        map.set(3);
        map.set(7);
        let text = ranged_string(&map, &t);
        assert_eq!(parse(&text, &t).unwrap(), map);
    }
}
