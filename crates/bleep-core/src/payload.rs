//! Write-probe payload construction.
//!
//! [`build_payload_iterator`] turns a value range, named patterns and an
//! optional file into an ordered, de-duplicated payload list. It is pure and
//! deterministic: identical arguments always give identical output.
//!
//! Pattern names:
//!
//! | pattern | payloads |
//! |---------|----------|
//! | `ascii` | `a`-`z`, `A`-`Z`, `0`-`9`, one byte each |
//! | `inc` / `increment` | `[0]`, `[0,1]`, ... up to 16 bytes |
//! | `alt` | `[0xAA]`, `[0x55]` |
//! | `repeat:<hexbyte>:<len>` | the byte repeated `len` times |
//! | `hex:<hexstring>` | the decoded bytes |
//!
//! Unknown names and malformed `repeat:`/`hex:` specs are skipped.

use std::collections::HashSet;

use tracing::debug;

use crate::types::Payload;

/// Number of steps produced by the `inc` pattern.
pub const INCREMENT_STEPS: u8 = 16;

/// Builds the ordered, de-duplicated payload list.
///
/// Order: range payloads, then patterns in the order given, then the file
/// contents as one final payload. `lo > hi` yields no range payloads and an
/// empty file is ignored.
#[must_use]
pub fn build_payload_iterator<S: AsRef<str>>(
    value_range: Option<(u8, u8)>,
    patterns: &[S],
    file_bytes: Option<&[u8]>,
) -> Vec<Payload> {
    let mut out = UniquePayloads::default();

    if let Some((lo, hi)) = value_range {
        for value in lo..=hi {
            out.push(vec![value]);
        }
    }

    for pattern in patterns {
        let spec = pattern.as_ref().trim();
        match expand_pattern(spec) {
            Some(payloads) => payloads.into_iter().for_each(|p| out.push(p)),
            None => debug!(pattern = spec, "Skipping unusable payload pattern"),
        }
    }

    if let Some(bytes) = file_bytes.filter(|b| !b.is_empty()) {
        out.push(bytes.to_vec());
    }

    out.into_inner()
}

fn expand_pattern(spec: &str) -> Option<Vec<Vec<u8>>> {
    match spec.to_ascii_lowercase().as_str() {
        "ascii" => {
            return Some(
                (b'a'..=b'z')
                    .chain(b'A'..=b'Z')
                    .chain(b'0'..=b'9')
                    .map(|b| vec![b])
                    .collect(),
            )
        }
        "inc" | "increment" => {
            return Some((1..=INCREMENT_STEPS).map(|n| (0..n).collect()).collect());
        }
        "alt" => return Some(vec![vec![0xAA], vec![0x55]]),
        _ => {}
    }

    if let Some(rest) = strip_prefix_ignore_case(spec, "repeat:") {
        let (byte, len) = rest.split_once(':')?;
        let byte = u8::from_str_radix(byte.trim().trim_start_matches("0x"), 16).ok()?;
        let len: usize = len.trim().parse().ok()?;
        if len == 0 {
            return None;
        }
        return Some(vec![vec![byte; len]]);
    }

    if let Some(rest) = strip_prefix_ignore_case(spec, "hex:") {
        let bytes = hex::decode(rest.trim()).ok()?;
        if bytes.is_empty() {
            return None;
        }
        return Some(vec![bytes]);
    }

    None
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
}

#[derive(Default)]
struct UniquePayloads {
    seen: HashSet<Vec<u8>>,
    ordered: Vec<Payload>,
}

impl UniquePayloads {
    fn push(&mut self, bytes: Vec<u8>) {
        if self.seen.insert(bytes.clone()) {
            self.ordered.push(Payload::new(bytes));
        }
    }

    fn into_inner(self) -> Vec<Payload> {
        self.ordered
    }
}
