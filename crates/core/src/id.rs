// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Job identifiers.
//!
//! A job id is a timestamped name like `2025-01-15T10-30-00-123__train`:
//! lexically sortable, unique per submission, and carrying the job name
//! after the `__` separator.

use chrono::{DateTime, Local};

/// Define a newtype ID wrapper around `String`.
///
/// Generates `new()`, `as_str()`, `Display`, `From<String>`, `From<&str>`,
/// and `PartialEq<&str>` implementations.
#[macro_export]
macro_rules! define_id {
    (
        $(#[$meta:meta])*
        pub struct $name:ident;
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }
    };
}

crate::define_id! {
    /// Unique identifier for a submitted job (timestamp + `__` + job name).
    pub struct JobId;
}

impl JobId {
    /// Generate a fresh id for a named job: `YYYY-MM-DDTHH-MM-SS-mmm__<name>`.
    pub fn generate(job_name: &str) -> Self {
        Self::generate_at(Local::now(), job_name)
    }

    /// Generate an id from an explicit timestamp (for tests).
    pub fn generate_at(now: DateTime<Local>, job_name: &str) -> Self {
        let stamp = now.format("%Y-%m-%dT%H-%M-%S");
        let millis = now.timestamp_subsec_millis();
        Self(format!("{stamp}-{millis:03}__{job_name}"))
    }
}

/// Extract the job name from an id (`...__train` → `train`).
/// Ids without the separator are returned unchanged.
pub fn job_name_from_id(job_id: &str) -> &str {
    match job_id.find("__") {
        Some(pos) if pos + 2 < job_id.len() => &job_id[pos + 2..],
        _ => job_id,
    }
}

/// Extract the timestamp prefix from an id.
pub fn timestamp_from_id(job_id: &str) -> &str {
    match job_id.find("__") {
        Some(pos) => &job_id[..pos],
        None => job_id,
    }
}

#[cfg(test)]
#[path = "id_tests.rs"]
mod tests;
