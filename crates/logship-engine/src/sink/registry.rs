// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Static table of the sink types this build can construct.
//!
//! A sink section selects its type with `sender_type`. The type decides which options are
//! accepted on top of the shared fault-tolerance options.

use std::collections::HashMap;
use std::sync::Arc;

use super::{discard, file, http, Sink};
use crate::config::options::{validate_options, OptionSpec, FT_OPTIONS};
use crate::error::ConfigError;

pub const KEY_SENDER_TYPE: &str = "sender_type";

pub type SinkConstructor = fn(&HashMap<String, String>) -> Result<Arc<dyn Sink>, ConfigError>;

#[derive(Clone, Copy)]
pub struct SinkType {
    pub name: &'static str,
    pub usage: &'static str,
    /// Options specific to this type. [`FT_OPTIONS`] apply to every type.
    pub options: &'static [OptionSpec],
    constructor: SinkConstructor,
}

impl SinkType {
    /// Every option accepted by this type, shared ones last.
    pub fn option_specs(&self) -> impl Iterator<Item = &'static OptionSpec> {
        self.options.iter().chain(FT_OPTIONS.iter())
    }

    /// Validates `options` against this type's schema and constructs the sink.
    pub fn build(&self, options: &HashMap<String, String>) -> Result<Arc<dyn Sink>, ConfigError> {
        validate_options(self.option_specs(), options)?;
        (self.constructor)(options)
    }
}

static SINK_TYPES: &[SinkType] = &[
    SinkType {
        name: discard::SINK_TYPE,
        usage: "Discard (drop every batch, for testing pipelines)",
        options: &[],
        constructor: discard::build,
    },
    SinkType {
        name: file::SINK_TYPE,
        usage: "File (append records as JSON lines to a local file)",
        options: file::FILE_OPTIONS,
        constructor: file::build,
    },
    SinkType {
        name: http::SINK_TYPE,
        usage: "HTTP (POST batches as JSON arrays to an endpoint)",
        options: http::HTTP_OPTIONS,
        constructor: http::build,
    },
];

pub fn lookup(name: &str) -> Result<&'static SinkType, ConfigError> {
    SINK_TYPES
        .iter()
        .find(|sink_type| sink_type.name == name)
        .ok_or_else(|| ConfigError::UnknownSinkType(name.to_string()))
}

/// `(type, usage)` of every registered sink type.
#[must_use]
pub fn usages() -> Vec<(&'static str, &'static str)> {
    SINK_TYPES.iter().map(|t| (t.name, t.usage)).collect()
}

/// Builds the sink selected by the `sender_type` option.
pub fn build(options: &HashMap<String, String>) -> Result<Arc<dyn Sink>, ConfigError> {
    let name = options
        .get(KEY_SENDER_TYPE)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::MissingOption(KEY_SENDER_TYPE.to_string()))?;
    lookup(name)?.build(options)
}
