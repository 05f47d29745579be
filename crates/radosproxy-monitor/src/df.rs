//! `df` report parser
//!
//! Each pool row of the report is a whitespace-separated line:
//!
//! ```text
//! POOLREF [PGS] STORED UNIT OBJECTS[k|M] USED UNIT RATIO AVAIL UNIT [...]
//! ```
//!
//! `POOLREF` is either `NAME ID` (the cluster's own layout) or `ID NAME`.
//! Anything after the max-avail unit is ignored. Lines that do not fit the
//! grammar (section banners, headers, raw storage rows, blanks) are skipped.

use radosproxy_common::PoolId;

const KIB: u64 = 1 << 10;
const MIB: u64 = 1 << 20;
const GIB: u64 = 1 << 30;
const TIB: u64 = 1 << 40;
const PIB: u64 = 1 << 50;

/// One parsed pool row
#[derive(Clone, Debug, PartialEq)]
pub struct DfRecord {
    pub pool_id: PoolId,
    pub name: String,
    /// Stored bytes
    pub stored: u64,
    pub objects: u64,
    /// Raw used bytes
    pub used: u64,
    /// `%USED` as a fraction
    pub use_ratio: f64,
    /// Max available bytes as reported, before any redundancy adjustment
    pub max_avail: u64,
}

/// Byte multiplier for a size unit
#[must_use]
pub fn unit_multiplier(unit: &str) -> Option<u64> {
    match unit {
        "B" => Some(1),
        "KiB" => Some(KIB),
        "MiB" => Some(MIB),
        "GiB" => Some(GIB),
        "TiB" => Some(TIB),
        "PiB" => Some(PIB),
        _ => None,
    }
}

fn parse_number(token: &str) -> Option<f64> {
    let digits = token.chars().filter(char::is_ascii_digit).count();
    let dots = token.chars().filter(|c| *c == '.').count();
    if digits == 0 || dots > 1 || digits + dots != token.len() {
        return None;
    }
    token.parse().ok()
}

fn is_integer(token: &str) -> bool {
    !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit())
}

fn parse_size(value: &str, unit: &str) -> Option<u64> {
    let value = parse_number(value)?;
    let mult = unit_multiplier(unit)?;
    Some(scale(value, mult))
}

fn parse_count(token: &str) -> Option<u64> {
    let (number, mult) = match token.as_bytes().last()? {
        b'k' | b'K' => (&token[..token.len() - 1], 1000),
        b'M' | b'm' => (&token[..token.len() - 1], 1_000_000),
        _ => (token, 1),
    };
    Some(scale(parse_number(number)?, mult))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn scale(value: f64, mult: u64) -> u64 {
    (value * mult as f64) as u64
}

fn pool_ref(tokens: &[&str]) -> Option<(PoolId, String)> {
    let (first, second) = (*tokens.first()?, *tokens.get(1)?);
    if is_integer(first) && parse_number(second).is_none() {
        Some((first.parse().ok()?, second.to_string()))
    } else if is_integer(second) {
        Some((second.parse().ok()?, first.to_string()))
    } else {
        None
    }
}

fn columns(rest: &[&str]) -> Option<(u64, u64, u64, f64, u64)> {
    let stored = parse_size(rest.first()?, rest.get(1)?)?;
    let objects = parse_count(rest.get(2)?)?;
    let used = parse_size(rest.get(3)?, rest.get(4)?)?;
    let ratio = parse_number(rest.get(5)?)?;
    let avail = parse_size(rest.get(6)?, rest.get(7)?)?;
    Some((stored, objects, used, ratio / 100.0, avail))
}

/// Parse one report line
#[must_use]
pub fn parse_line(line: &str) -> Option<DfRecord> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let (pool_id, name) = pool_ref(&tokens)?;
    let rest = &tokens[2..];

    let parsed = columns(rest).or_else(|| {
        // Optional PGS column before STORED
        if rest.first().is_some_and(|t| is_integer(t)) {
            columns(&rest[1..])
        } else {
            None
        }
    });
    let (stored, objects, used, use_ratio, max_avail) = parsed?;

    Some(DfRecord {
        pool_id,
        name,
        stored,
        objects,
        used,
        use_ratio,
        max_avail,
    })
}

/// Parse every pool row of a report, skipping lines that do not match
#[must_use]
pub fn parse_report(text: &str) -> Vec<DfRecord> {
    text.lines().filter_map(parse_line).collect()
}
