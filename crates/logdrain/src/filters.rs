// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Truncation and token redaction.
//!
//! The same [`Filters`] value backs the splitter fast path and the `truncate` /
//! `obfuscate_token` transforms, so a record comes out identical whichever path rewrote it.
//! Lengths are counted in characters so a cut never lands inside a UTF-8 sequence.

use std::borrow::Cow;

use regex::{Captures, Regex};

use crate::errors::ConfigError;

/// Inserted between the kept head and tail of a truncated record.
pub const TRUNCATED_PLACEHOLDER: &str = " __TRUNCATED__ ";
/// Replaces the captured token value.
pub const TOKEN_PLACEHOLDER: &str = "__TOKEN_REPLACED__";

pub const DEFAULT_MAX_MSG_LENGTH: usize = 1000;
pub const DEFAULT_STACK_PATTERN: &str = "stack";
pub const DEFAULT_TOKEN_PATTERN: &str = r#"(token":")(.*?)(")"#;

#[derive(Debug, Clone)]
pub struct Filters {
    truncate_activated: bool,
    max_msg_length: Option<usize>,
    stack_pattern: Regex,
    token_pattern: Regex,
}

impl Filters {
    /// Compiles the stack-trace exemption and token patterns.
    ///
    /// The token pattern must expose at least three capture groups: the text before the token,
    /// the token itself and the text after it. Only the second group is replaced.
    pub fn new(
        truncate_activated: bool,
        max_msg_length: Option<usize>,
        stack_pattern: &str,
        token_pattern: &str,
    ) -> Result<Self, ConfigError> {
        let stack_pattern =
            Regex::new(stack_pattern).map_err(|source| ConfigError::InvalidPattern {
                name: "TRUNCATE_EXCEPT_STACK_PATTERN",
                source,
            })?;
        let token_pattern =
            Regex::new(token_pattern).map_err(|source| ConfigError::InvalidPattern {
                name: "REPLACE_TOKEN_PATTERN",
                source,
            })?;
        // captures_len counts the implicit whole-match group
        if token_pattern.captures_len() < 4 {
            return Err(ConfigError::InvalidValue {
                name: "REPLACE_TOKEN_PATTERN",
                expected: "a pattern with three capture groups",
                value: token_pattern.as_str().to_string(),
            });
        }
        Ok(Self {
            truncate_activated,
            max_msg_length,
            stack_pattern,
            token_pattern,
        })
    }

    pub fn truncate_activated(&self) -> bool {
        self.truncate_activated
    }

    pub fn max_msg_length(&self) -> Option<usize> {
        self.max_msg_length
    }

    /// Returns a copy with another truncation threshold, `None` disabling truncation.
    #[must_use]
    pub fn with_max_msg_length(mut self, max_msg_length: Option<usize>) -> Self {
        self.max_msg_length = max_msg_length;
        self
    }

    /// Whether the splitter should redact and truncate records while decoding.
    pub fn fast_path_enabled(&self) -> bool {
        self.truncate_activated && self.max_msg_length.is_some()
    }

    /// Keeps the first `max / 2` and last `max - max / 2` characters of an oversized record.
    ///
    /// Records matching the stack pattern are never truncated.
    pub fn truncate<'a>(&self, text: &'a str) -> Cow<'a, str> {
        let Some(max) = self.max_msg_length else {
            return Cow::Borrowed(text);
        };
        let len = text.chars().count();
        if len <= max || self.stack_pattern.is_match(text) {
            return Cow::Borrowed(text);
        }

        let head_len = max / 2;
        let tail_len = max - head_len;
        let head_end = char_boundary(text, head_len);
        let tail_start = char_boundary(text, len - tail_len);

        let mut truncated =
            String::with_capacity(head_end + TRUNCATED_PLACEHOLDER.len() + text.len() - tail_start);
        truncated.push_str(&text[..head_end]);
        truncated.push_str(TRUNCATED_PLACEHOLDER);
        truncated.push_str(&text[tail_start..]);
        Cow::Owned(truncated)
    }

    /// Replaces the token group of every match, keeping the surrounding groups verbatim.
    pub fn obfuscate<'a>(&self, text: &'a str) -> Cow<'a, str> {
        self.token_pattern.replace_all(text, |caps: &Captures| {
            let before = caps.get(1).map_or("", |m| m.as_str());
            let after = caps.get(3).map_or("", |m| m.as_str());
            format!("{before}{TOKEN_PLACEHOLDER}{after}")
        })
    }

    /// Redaction followed by truncation, as applied by the octet-counting splitter.
    pub fn fast_path(&self, text: String) -> String {
        if !self.fast_path_enabled() {
            return text;
        }
        let redacted = match self.obfuscate(&text) {
            Cow::Borrowed(_) => text,
            Cow::Owned(redacted) => redacted,
        };
        match self.truncate(&redacted) {
            Cow::Borrowed(_) => redacted,
            Cow::Owned(truncated) => truncated,
        }
    }
}

impl Default for Filters {
    #[allow(clippy::expect_used)]
    fn default() -> Self {
        Self::new(
            true,
            Some(DEFAULT_MAX_MSG_LENGTH),
            DEFAULT_STACK_PATTERN,
            DEFAULT_TOKEN_PATTERN,
        )
        .expect("default filter patterns are valid")
    }
}

/// Byte offset of the `nth` character, or the end of the string.
fn char_boundary(text: &str, nth: usize) -> usize {
    text.char_indices()
        .nth(nth)
        .map_or(text.len(), |(index, _)| index)
}
