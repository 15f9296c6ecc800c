// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Negotiated option vectors.
//!
//! The gateway answers the CONNECT upgrade with `X-CSTP-*` and `X-DTLS-*`
//! headers. Each one is retained verbatim, in arrival order, because the set
//! is re-logged unchanged after a reconnect and repeatable headers (DNS,
//! NBNS) keep every occurrence. Unknown options are kept for diagnostics and
//! never affect behaviour.

use std::{fmt, str::FromStr};

/// One negotiated option as returned by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpnOption {
    pub option: String,
    pub value: String,
}

impl fmt::Display for VpnOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.option, self.value)
    }
}

/// Insertion-ordered collection of negotiated options.
#[derive(Debug, Clone, Default)]
pub struct OptionSet {
    entries: Vec<VpnOption>,
}

impl OptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, option: impl Into<String>, value: impl Into<String>) {
        self.entries.push(VpnOption {
            option: option.into(),
            value: value.into(),
        });
    }

    /// First value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|o| o.option.eq_ignore_ascii_case(name))
            .map(|o| o.value.as_str())
    }

    /// Every value for a repeatable option, in arrival order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |o| o.option.eq_ignore_ascii_case(name))
            .map(|o| o.value.as_str())
    }

    /// First value for `name` parsed into `T`; `None` when absent or
    /// unparseable.
    pub fn get_parsed<T: FromStr>(&self, name: &str) -> Option<T> {
        self.get(name).and_then(|v| v.parse().ok())
    }

    pub fn iter(&self) -> impl Iterator<Item = &VpnOption> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
