use std::{collections::HashSet, fmt, ops::Deref};

use serde::{Deserialize, Serialize};

use crate::{Result, TrainerErr};

/// An ordered, duplicate free, non-empty list of device ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<usize>", into = "Vec<usize>")]
pub struct DeviceSet(Vec<usize>);

impl DeviceSet {
    /// Creates a new `DeviceSet` from a list of ids.
    ///
    /// # Errors
    /// A `Config` error if `ids` is empty or contains duplicates.
    pub fn new(ids: Vec<usize>) -> Result<Self> {
        if ids.is_empty() {
            return Err(TrainerErr::config("the device list must not be empty"));
        }

        let mut seen = HashSet::with_capacity(ids.len());
        if let Some(dup) = ids.iter().find(|id| !seen.insert(**id)) {
            return Err(TrainerErr::config(format!("device {dup} is listed twice")));
        }

        Ok(Self(ids))
    }

    /// Parses a device string.
    ///
    /// Accepts an optional `<kind>:` prefix followed either by an inclusive range `a-b` or by a
    /// comma separated list `a,b,c`, e.g. `gpu:0-3` or `cpu:1,3`.
    ///
    /// # Errors
    /// A `Config` error if the string is malformed or names a device twice.
    pub fn parse(s: &str) -> Result<Self> {
        let ids = s.split_once(':').map_or(s, |(_, ids)| ids).trim();

        if ids.is_empty() {
            return Err(TrainerErr::config(format!("no devices in '{s}'")));
        }

        if let Some((a, b)) = ids.split_once('-') {
            let a = parse_id(s, a)?;
            let b = parse_id(s, b)?;
            if a > b {
                return Err(TrainerErr::config(format!(
                    "reversed device range in '{s}'"
                )));
            }
            return Self::new((a..=b).collect());
        }

        let ids = ids
            .split(',')
            .map(|id| parse_id(s, id))
            .collect::<Result<Vec<_>>>()?;

        Self::new(ids)
    }

    /// Drops every device past the first `len`, never going below one device.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.0.truncate(len.max(1));
    }
}

fn parse_id(s: &str, id: &str) -> Result<usize> {
    id.trim()
        .parse()
        .map_err(|_| TrainerErr::config(format!("invalid device id '{id}' in '{s}'")))
}

impl Default for DeviceSet {
    fn default() -> Self {
        Self(vec![0])
    }
}

impl Deref for DeviceSet {
    type Target = [usize];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<Vec<usize>> for DeviceSet {
    type Error = TrainerErr;

    fn try_from(ids: Vec<usize>) -> Result<Self> {
        Self::new(ids)
    }
}

impl From<DeviceSet> for Vec<usize> {
    fn from(devices: DeviceSet) -> Self {
        devices.0
    }
}

impl fmt::Display for DeviceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<_> = self.0.iter().map(|id| id.to_string()).collect();
        write!(f, "[{}]", ids.join(","))
    }
}
