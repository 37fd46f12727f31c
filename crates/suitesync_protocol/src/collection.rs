//! Collection names shared by the REST API and the change feed.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A remote collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    /// Test suites.
    Suites,
    /// The singleton running/finished counters for suites.
    SuiteAggs,
    /// Test cases.
    Cases,
    /// Log lines.
    Logs,
    /// Attachments.
    Attachments,
}

impl Collection {
    /// All known collections.
    pub const ALL: [Collection; 5] = [
        Collection::Suites,
        Collection::SuiteAggs,
        Collection::Cases,
        Collection::Logs,
        Collection::Attachments,
    ];

    /// Returns the wire name, also used as the URL path segment.
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Suites => "suites",
            Collection::SuiteAggs => "suite_aggs",
            Collection::Cases => "cases",
            Collection::Logs => "logs",
            Collection::Attachments => "attachments",
        }
    }

    /// Returns true for collections holding a single aggregate record.
    pub fn is_aggregate(&self) -> bool {
        matches!(self, Collection::SuiteAggs)
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Collection::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownCollection { name: s.into() })
    }
}
