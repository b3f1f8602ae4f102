// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The work item handle handed over by the pipeline.
//!
//! The monitor never interprets an item. It only reads its identity, where it
//! came from, and its named fields when building diagnostic attributes.

use crate::key::Identity;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Shared handle to a work item retained by a tracked record.
pub type WorkItemRef = Arc<dyn WorkItem>;

/// A unit of work flowing through a pipeline component.
pub trait WorkItem: fmt::Debug + Send + Sync {
    /// Identity used for correlation and sampling.
    fn identity(&self) -> Identity;

    /// Component that produced this item.
    fn source_component(&self) -> &str;

    /// Channel (stream) the item arrived on.
    fn source_stream(&self) -> &str;

    /// Value of a named field rendered as a string.
    fn field(&self, name: &str) -> Option<String>;

    /// Names of every field carried by the item.
    fn field_names(&self) -> Vec<&str>;

    /// Full rendering of the item, used for expiry diagnostics.
    fn describe(&self) -> String {
        format!("{self:?}")
    }
}

/// A named-field work item, the shape most stream frameworks use.
#[derive(Debug, Clone, Serialize)]
pub struct Tuple {
    #[serde(skip)]
    identity: Identity,
    source_component: String,
    source_stream: String,
    fields: Vec<(String, serde_json::Value)>,
}

impl Tuple {
    #[must_use]
    pub fn new(source_component: impl Into<String>, source_stream: impl Into<String>) -> Self {
        Self {
            identity: Identity::next(),
            source_component: source_component.into(),
            source_stream: source_stream.into(),
            fields: Vec::new(),
        }
    }

    /// Appends a field, replacing an earlier value with the same name.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((name, value)),
        }
        self
    }

    #[must_use]
    pub fn into_ref(self) -> WorkItemRef {
        Arc::new(self)
    }
}

impl WorkItem for Tuple {
    fn identity(&self) -> Identity {
        self.identity
    }

    fn source_component(&self) -> &str {
        &self.source_component
    }

    fn source_stream(&self) -> &str {
        &self.source_stream
    }

    fn field(&self, name: &str) -> Option<String> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, value)| match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
    }

    fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|(n, _)| n.as_str()).collect()
    }

    fn describe(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{self:?}"))
    }
}
