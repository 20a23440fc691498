use std::fmt;
use std::str::FromStr;

use crate::BackplaneError;

/// A `<group>-<detail>` code. The group identifies the command that failed
/// and the detail identifies the check that rejected it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProblemCode {
    group: u8,
    detail: u8,
}

impl ProblemCode {
    pub const fn new(group: u8, detail: u8) -> Self {
        Self { group, detail }
    }

    pub fn group(self) -> u8 {
        self.group
    }

    pub fn detail(self) -> u8 {
        self.detail
    }

    /// Text carried in the `problem` field of a report: `"g-d\n"`.
    pub fn wire(self) -> String {
        format!("{}-{}\n", self.group, self.detail)
    }
}

impl fmt::Display for ProblemCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.group, self.detail)
    }
}

impl FromStr for ProblemCode {
    type Err = BackplaneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || BackplaneError::MalformedPayload(format!("bad problem code '{}'", s.trim()));
        let (g, d) = s.trim().split_once('-').ok_or_else(bad)?;
        Ok(Self::new(
            g.parse().map_err(|_| bad())?,
            d.parse().map_err(|_| bad())?,
        ))
    }
}

/// A rejected command: the code sent to callers plus a reason for the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProblemReport {
    pub code: ProblemCode,
    pub reason: &'static str,
}

impl ProblemReport {
    pub const fn new(code: ProblemCode, reason: &'static str) -> Self {
        Self { code, reason }
    }
}

impl fmt::Display for ProblemReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code, self.reason)
    }
}
