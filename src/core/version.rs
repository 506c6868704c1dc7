use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};

/// Toolchain release such as `go1.21.3`, `1.18` or `go1.22rc1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolchainVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionError {
    pub input: String,
}

impl fmt::Display for VersionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid toolchain version: {:?} (expected <major>[.<minor>], e.g. 1.18 or go1.21.3)",
            self.input
        )
    }
}

impl std::error::Error for VersionError {}

impl ToolchainVersion {
    /// True when this (current) version meets `required`. Patch levels are
    /// not part of the requirement.
    pub fn satisfies(&self, required: &ToolchainVersion) -> bool {
        self.major > required.major
            || (self.major == required.major && self.minor >= required.minor)
    }
}

impl FromStr for ToolchainVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || VersionError {
            input: s.to_string(),
        };
        let rest = s.trim();
        let rest = rest.strip_prefix("go").unwrap_or(rest);

        let (major, rest) = leading_number(rest).ok_or_else(err)?;
        let mut minor = 0;
        let mut patch = None;
        let mut rest = rest;
        if let Some(after) = rest.strip_prefix('.') {
            let (n, after) = leading_number(after).ok_or_else(err)?;
            minor = n;
            rest = after;
            if let Some(after) = rest.strip_prefix('.') {
                let (n, after) = leading_number(after).ok_or_else(err)?;
                patch = Some(n);
                rest = after;
            }
        }

        // Anything left must be a tag like `rc1` or trailing text after
        // whitespace, never another number or separator.
        match rest.chars().next() {
            None => {}
            Some(c) if c.is_ascii_alphabetic() || c.is_whitespace() => {}
            Some(_) => return Err(err()),
        }

        Ok(ToolchainVersion {
            major,
            minor,
            patch,
        })
    }
}

impl fmt::Display for ToolchainVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)?;
        if let Some(patch) = self.patch {
            write!(f, ".{patch}")?;
        }
        Ok(())
    }
}

impl Serialize for ToolchainVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Whether `current` meets the `required` toolchain version. Malformed input
/// on either side is an error.
pub fn satisfies(required: &str, current: &str) -> Result<bool, VersionError> {
    let required: ToolchainVersion = required.parse()?;
    let current: ToolchainVersion = current.parse()?;
    Ok(current.satisfies(&required))
}

fn leading_number(s: &str) -> Option<(u32, &str)> {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    if end == 0 {
        return None;
    }
    let n = s[..end].parse::<u32>().ok()?;
    Some((n, &s[end..]))
}
