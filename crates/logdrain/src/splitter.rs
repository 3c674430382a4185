// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Syslog drain framing.
//!
//! [`Splitter::split`] decodes octet-counted frames as described in
//! <https://tools.ietf.org/html/rfc6587#section-3.4.1>. [`split_multiline`] is the lenient
//! decoder used by the multi-line routes, where lengths count characters and frames may be
//! separated by arbitrary whitespace.

use tracing::debug;

use crate::errors::FramingError;
use crate::filters::Filters;

#[derive(Debug, Clone, Default)]
pub struct Splitter {
    filters: Filters,
}

impl Splitter {
    pub fn new(filters: Filters) -> Self {
        Self { filters }
    }

    pub fn filters(&self) -> &Filters {
        &self.filters
    }

    /// Splits an octet-counted payload into records.
    ///
    /// The whole payload must be consumed: a frame with a bad length prefix, or one declaring more
    /// bytes than remain, fails the call and no record is returned. A single trailing `\n` or `\r`
    /// is dropped from each body and invalid UTF-8 is replaced. When truncation is activated every
    /// record also goes through [`Filters::fast_path`].
    pub fn split(&self, payload: &[u8]) -> Result<Vec<String>, FramingError> {
        let mut records = Vec::new();
        let mut offset = 0;

        while offset < payload.len() {
            let rest = &payload[offset..];
            let separator = rest
                .iter()
                .position(|&byte| byte == b' ')
                .ok_or(FramingError::MissingSeparator { offset })?;

            let prefix = &rest[..separator];
            let declared =
                parse_length(prefix).ok_or_else(|| FramingError::InvalidLength {
                    offset,
                    prefix: String::from_utf8_lossy(prefix).into_owned(),
                })?;

            let body_start = separator + 1;
            let remaining = rest.len() - body_start;
            if declared > remaining {
                return Err(FramingError::Truncated {
                    offset,
                    declared,
                    remaining,
                });
            }

            let mut body = &rest[body_start..body_start + declared];
            if let [head @ .., b'\n' | b'\r'] = body {
                body = head;
            }

            let record = String::from_utf8_lossy(body).into_owned();
            records.push(self.filters.fast_path(record));
            offset += body_start + declared;
        }

        debug!("Split {} bytes into {} records", payload.len(), records.len());
        Ok(records)
    }
}

/// ASCII digits only, so signs and whitespace are rejected.
fn parse_length(prefix: &[u8]) -> Option<usize> {
    if prefix.is_empty() || !prefix.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(prefix).ok()?.parse().ok()
}

/// Splits a `<length> <message>` sequence where lengths count characters.
///
/// Frames are separated by any amount of whitespace and the last frame may be shorter than
/// declared. No filtering is applied.
pub fn split_multiline(payload: &[u8]) -> Result<Vec<String>, FramingError> {
    let text = std::str::from_utf8(payload)
        .map_err(|err| FramingError::InvalidUtf8(err.to_string()))?
        .trim();

    let mut records = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let offset = text.len() - rest.len();
        let (token, remainder) = rest
            .split_once(char::is_whitespace)
            .ok_or_else(|| FramingError::MissingMessage(rest.to_string()))?;
        let size: usize = token.parse().map_err(|_| FramingError::InvalidLength {
            offset,
            prefix: token.to_string(),
        })?;

        let remainder = remainder.trim_start();
        let end = remainder
            .char_indices()
            .nth(size)
            .map_or(remainder.len(), |(index, _)| index);
        records.push(remainder[..end].to_string());
        rest = remainder[end..].trim();
    }

    Ok(records)
}
