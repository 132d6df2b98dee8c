// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Types shared between the NPM dataplane engine and its consumers.
//!
//! Everything in here either crosses a process boundary (the cache
//! snapshot, the diagnostic rule records) or names a concept that
//! both the engine and the admin tooling need to agree on (set types,
//! hashed set names, directions).

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

pub mod cache;
pub mod mac;
pub mod policy;
pub mod rule;
pub mod set;

pub use cache::*;
pub use mac::*;
pub use policy::*;
pub use rule::*;
pub use set::*;

/// The direction of traffic a rule or policy applies to, relative to
/// the pod.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Ingress,
    Egress,
    #[default]
    Undefined,
}

impl Direction {
    /// Derive the direction from the name of an NPM chain.
    ///
    /// The chain namespace encodes direction in the name itself, e.g.
    /// `AZURE-NPM-EGRESS-PORT` or `AZURE-NPM-INGRESS-FROM`.
    pub fn from_chain_name(chain: &str) -> Self {
        if chain.contains("EGRESS") {
            Self::Egress
        } else if chain.contains("INGRESS") {
            Self::Ingress
        } else {
            Self::Undefined
        }
    }
}

impl core::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "in" | "ingress" => Ok(Direction::Ingress),
            "out" | "egress" => Ok(Direction::Egress),
            "undefined" => Ok(Direction::Undefined),
            _ => Err(format!("invalid direction: {s}")),
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let dirstr = match self {
            Direction::Ingress => "INGRESS",
            Direction::Egress => "EGRESS",
            Direction::Undefined => "UNDEFINED",
        };

        write!(f, "{dirstr}")
    }
}
