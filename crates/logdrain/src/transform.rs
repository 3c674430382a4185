// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-route payload transforms.
//!
//! Transforms are plain functions registered under a stable name. A route's chain is resolved
//! once from the [`PluginTable`] and then folded over every record, left to right. The first
//! failing transform drops that record.

use std::collections::HashMap;
use std::fmt;

use crate::errors::TransformError;
use crate::filters::Filters;

/// Matches any api or version in the plugin table.
pub const WILDCARD: &str = "*";

pub type TransformFn = fn(&str, &Filters) -> Result<String, TransformError>;

#[derive(Clone, Copy)]
pub struct Transform {
    name: &'static str,
    apply: TransformFn,
}

impl Transform {
    pub const fn new(name: &'static str, apply: TransformFn) -> Self {
        Self { name, apply }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn apply(&self, text: &str, filters: &Filters) -> Result<String, TransformError> {
        (self.apply)(text, filters)
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Transform").field(&self.name).finish()
    }
}

const REGISTRY: &[Transform] = &[
    Transform::new("truncate", truncate),
    Transform::new("obfuscate_token", obfuscate_token),
];

/// Looks up a registered transform by name.
pub fn lookup(name: &str) -> Option<Transform> {
    REGISTRY
        .iter()
        .find(|transform| transform.name == name)
        .copied()
}

/// Names accepted by [`lookup`].
pub fn registered_names() -> impl Iterator<Item = &'static str> {
    REGISTRY.iter().map(|transform| transform.name)
}

fn truncate(text: &str, filters: &Filters) -> Result<String, TransformError> {
    Ok(filters.truncate(text).into_owned())
}

fn obfuscate_token(text: &str, filters: &Filters) -> Result<String, TransformError> {
    Ok(filters.obfuscate(text).into_owned())
}

/// Transforms keyed by api then version, either of which may be [`WILDCARD`].
#[derive(Debug, Clone, Default)]
pub struct PluginTable {
    entries: HashMap<String, HashMap<String, Vec<Transform>>>,
}

impl PluginTable {
    pub fn insert(&mut self, api: &str, ver: &str, transform: Transform) {
        self.entries
            .entry(api.to_string())
            .or_default()
            .entry(ver.to_string())
            .or_default()
            .push(transform);
    }

    fn get(&self, api: &str, ver: &str) -> &[Transform] {
        self.entries
            .get(api)
            .and_then(|versions| versions.get(ver))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransformChain {
    transforms: Vec<Transform>,
}

impl TransformChain {
    pub fn new(transforms: Vec<Transform>) -> Self {
        Self { transforms }
    }

    /// Chain for one route: `[api][*]`, then `[api][ver]`, then `[*][*]`.
    ///
    /// A wildcard api or version on the route itself is not expanded, so `[api][*]` is only added
    /// once when `ver` is `*`.
    pub fn resolve(table: &PluginTable, api: &str, ver: &str) -> Self {
        let mut transforms = table.get(api, WILDCARD).to_vec();
        if ver != WILDCARD {
            transforms.extend_from_slice(table.get(api, ver));
        }
        if api != WILDCARD {
            transforms.extend_from_slice(table.get(WILDCARD, WILDCARD));
        }
        Self { transforms }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.transforms.iter().map(Transform::name).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    pub fn apply(&self, text: &str, filters: &Filters) -> Result<String, TransformError> {
        let mut current = text.to_string();
        for transform in &self.transforms {
            current = transform.apply(&current, filters)?;
        }
        Ok(current)
    }
}
