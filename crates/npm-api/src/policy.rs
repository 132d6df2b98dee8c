// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! ACL policies programmed onto endpoints.

use super::Direction;
use core::fmt;
use core::fmt::Display;
use core::str::FromStr;
use serde::Deserialize;
use serde::Serialize;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Verdict {
    Allow,
    Deny,
}

impl FromStr for Verdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "allow" => Ok(Self::Allow),
            "deny" => Ok(Self::Deny),
            _ => Err(format!("invalid verdict: {s}")),
        }
    }
}

impl Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Allow => "ALLOW",
            Self::Deny => "DENY",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "sctp" => Ok(Self::Sctp),
            _ => Err(format!("invalid protocol: {s}")),
        }
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Sctp => "sctp",
        };
        write!(f, "{s}")
    }
}

/// An inclusive port range; a single port has `start == end`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl FromStr for PortRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |p: &str| {
            p.parse::<u16>().map_err(|e| format!("bad port {p}: {e}"))
        };

        let (start, end) = match s.split_once('-') {
            Some((start, end)) => (parse(start)?, parse(end)?),
            None => {
                let port = parse(s)?;
                (port, port)
            }
        };

        if start > end {
            return Err(format!("port range start after end: {s}"));
        }

        Ok(Self { start, end })
    }
}

impl Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// A reference from a policy to an IP set, by human-readable name.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SetReference {
    pub name: String,
    /// `false` when the policy matches everything *not* in the set.
    pub included: bool,
}

/// A single programmed firewall decision.
///
/// Policies are whole objects: an update replaces the previous policy
/// of the same name rather than merging into it.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct AclPolicy {
    pub policy_name: String,
    pub verdict: Verdict,
    pub direction: Direction,
    pub protocol: Option<Protocol>,
    pub ports: Option<PortRange>,
    pub src_sets: Vec<SetReference>,
    pub dst_sets: Vec<SetReference>,
}

impl AclPolicy {
    pub fn new(name: &str, verdict: Verdict, direction: Direction) -> Self {
        Self {
            policy_name: name.to_string(),
            verdict,
            direction,
            protocol: None,
            ports: None,
            src_sets: vec![],
            dst_sets: vec![],
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn port_ranges() {
        let pr: PortRange = "8080".parse().unwrap();
        assert_eq!(pr, PortRange { start: 8080, end: 8080 });
        assert_eq!(pr.to_string(), "8080");

        let pr: PortRange = "1000-2000".parse().unwrap();
        assert_eq!(pr.to_string(), "1000-2000");

        assert!("2000-1000".parse::<PortRange>().is_err());
        assert!("70000".parse::<PortRange>().is_err());
    }
}
