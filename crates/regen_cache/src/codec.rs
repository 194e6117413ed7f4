// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Timestamped value codec.
//!
//! Entries are stored as `<RFC 3339 UTC>;<payload>`. The creation instant is
//! rendered with fixed nanosecond width, which pins the separator to a known
//! position well inside the first [`TIMESTAMP_PREFIX_LEN`] bytes: reading
//! just that prefix from the external store is enough to recover the
//! creation time without transferring the payload.

use chrono::{DateTime, SecondsFormat, Utc};
use regen_cache_backend::Error;

/// How many leading bytes of a stored entry are guaranteed to contain the
/// creation timestamp and its separator.
pub const TIMESTAMP_PREFIX_LEN: usize = 50;

/// The separator may not appear before this byte; anything earlier cannot be
/// a full timestamp.
const MIN_SEPARATOR_INDEX: usize = 20;

/// Encodes a creation instant and payload into the stored form.
#[must_use]
pub fn encode(created_at: DateTime<Utc>, payload: &str) -> String {
    let mut out = created_at.to_rfc3339_opts(SecondsFormat::Nanos, true);
    out.reserve(payload.len() + 1);
    out.push(';');
    out.push_str(payload);
    out
}

/// Decodes a stored entry into its creation instant and payload.
///
/// # Errors
///
/// Returns [`Error::MalformedEntry`] if the separator is missing or out of
/// position, or if the prefix does not parse as a UTC instant.
pub fn decode(raw: &str) -> Result<(DateTime<Utc>, String), Error> {
    let (created_at, separator) = split_timestamp(raw)?;
    Ok((created_at, raw[separator + 1..].to_owned()))
}

/// Decodes only the creation instant from an entry prefix.
///
/// Accepts any slice that still contains the separator, so the first
/// [`TIMESTAMP_PREFIX_LEN`] bytes of a stored entry are always enough.
///
/// # Errors
///
/// Same rejection rules as [`decode`].
pub fn decode_timestamp(prefix: &str) -> Result<DateTime<Utc>, Error> {
    split_timestamp(prefix).map(|(created_at, _)| created_at)
}

fn split_timestamp(raw: &str) -> Result<(DateTime<Utc>, usize), Error> {
    let separator = raw
        .find(';')
        .ok_or_else(|| malformed("no separator within the timestamp prefix"))?;
    if !(MIN_SEPARATOR_INDEX..=TIMESTAMP_PREFIX_LEN).contains(&separator) {
        return Err(malformed(format!(
            "separator at byte {separator}, outside {MIN_SEPARATOR_INDEX}..={TIMESTAMP_PREFIX_LEN}"
        )));
    }
    let created_at = DateTime::parse_from_rfc3339(&raw[..separator])
        .map_err(|error| malformed(format!("unparseable creation time: {error}")))?;
    Ok((created_at.with_timezone(&Utc), separator))
}

fn malformed(reason: impl Into<String>) -> Error {
    Error::MalformedEntry { reason: reason.into() }
}
