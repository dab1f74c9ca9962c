// Copyright (c) Syncpoint contributors
// SPDX-License-Identifier: Apache-2.0

//! Restore-point names.

use std::{fmt, str::FromStr};

use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

const PREFIX: &str = "sync_point_";
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Error returned when a string is not a well-formed restore-point name.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("invalid restore point name '{0}': expected sync_point_YYYYMMDD_HHMMSS")]
pub struct RestorePointNameError(pub String);

/// The name of a cluster-wide restore point: `sync_point_YYYYMMDD_HHMMSS`
/// with the timestamp in UTC.
///
/// Names are globally unique within a deployment and order chronologically,
/// which for this fixed-width format coincides with lexicographic order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RestorePointName {
    name: String,
    timestamp: NaiveDateTime,
}

impl RestorePointName {
    /// Generates the name for a restore point taken at `now`.
    pub fn generate(now: DateTime<Utc>) -> Self {
        let timestamp = now
            .naive_utc()
            .with_nanosecond(0)
            .expect("zero is a valid nanosecond");
        RestorePointName {
            name: format!("{PREFIX}{}", timestamp.format(TIMESTAMP_FORMAT)),
            timestamp,
        }
    }

    /// The name one second later, used to sidestep a duplicate-name
    /// collision.
    pub fn successor(&self) -> Self {
        let timestamp = self.timestamp + chrono::Duration::seconds(1);
        RestorePointName {
            name: format!("{PREFIX}{}", timestamp.format(TIMESTAMP_FORMAT)),
            timestamp,
        }
    }

    /// The UTC timestamp embedded in the name.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp.and_utc()
    }

    /// The name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// The manifest filename for this restore point.
    pub fn manifest_file_name(&self) -> String {
        format!("{}.json", self.name)
    }
}

impl fmt::Display for RestorePointName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl FromStr for RestorePointName {
    type Err = RestorePointNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let stamp = s
            .strip_prefix(PREFIX)
            .ok_or_else(|| RestorePointNameError(s.into()))?;
        let timestamp = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT)
            .map_err(|_| RestorePointNameError(s.into()))?;
        Ok(RestorePointName {
            name: s.to_owned(),
            timestamp,
        })
    }
}

impl Serialize for RestorePointName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name)
    }
}

impl<'de> Deserialize<'de> for RestorePointName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
