// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! IP set naming and classification.

use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

/// Every kernel-visible set name starts with this prefix.
pub const HASHED_NAME_PREFIX: &str = "azure-npm-";

/// Prefix of sets holding the pods of a namespace.
pub const NAMESPACE_PREFIX: &str = "ns-";

/// Prefix of sets holding the IP/port pairs behind a named port.
pub const NAMED_PORT_PREFIX: &str = "namedport:";

/// Separates a label key from its value (and nested label terms) in
/// a set name.
pub const LABEL_DELIMITER: &str = ":";

const FNV32_OFFSET: u32 = 0x811c_9dc5;
const FNV32_PRIME: u32 = 0x0100_0193;

/// Return the kernel-visible identifier of the set called `name`.
///
/// Kernel set names are limited in both length and character set, so
/// the human-readable name is hashed (32-bit FNV-1a, printed in
/// decimal) and prefixed. The mapping is deterministic: the same name
/// always produces the same identifier, on every node.
pub fn hashed_name(name: &str) -> String {
    let hash = name.bytes().fold(FNV32_OFFSET, |h, b| {
        (h ^ u32::from(b)).wrapping_mul(FNV32_PRIME)
    });
    format!("{HASHED_NAME_PREFIX}{hash}")
}

/// The two kernel set flavours.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum SetKind {
    /// A flat set of IP addresses.
    Hash,
    /// A set whose members are other sets.
    List,
}

impl Display for SetKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Hash => "hash",
            Self::List => "list",
        };
        write!(f, "{s}")
    }
}

/// What a set represents in terms of the Kubernetes model.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum SetType {
    /// A set created implicitly, before anything declared its type.
    #[default]
    Unknown,
    NameSpace,
    KeyLabelOfNameSpace,
    KeyValueLabelOfNameSpace,
    KeyLabelOfPod,
    KeyValueLabelOfPod,
    NamedPorts,
    NestedLabelOfPod,
    CidrBlocks,
}

impl SetType {
    /// The kind of kernel set backing this type.
    ///
    /// This is the only place kind is decided; it is never stored
    /// alongside the type.
    pub const fn kind(&self) -> SetKind {
        match self {
            Self::Unknown
            | Self::NameSpace
            | Self::KeyLabelOfPod
            | Self::KeyValueLabelOfPod
            | Self::NamedPorts
            | Self::CidrBlocks => SetKind::Hash,

            Self::KeyLabelOfNameSpace
            | Self::KeyValueLabelOfNameSpace
            | Self::NestedLabelOfPod => SetKind::List,
        }
    }
}

impl core::str::FromStr for SetType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unknown" => Ok(Self::Unknown),
            "namespace" => Ok(Self::NameSpace),
            "keylabelofnamespace" => Ok(Self::KeyLabelOfNameSpace),
            "keyvaluelabelofnamespace" => Ok(Self::KeyValueLabelOfNameSpace),
            "keylabelofpod" => Ok(Self::KeyLabelOfPod),
            "keyvaluelabelofpod" => Ok(Self::KeyValueLabelOfPod),
            "namedports" => Ok(Self::NamedPorts),
            "nestedlabelofpod" => Ok(Self::NestedLabelOfPod),
            "cidrblocks" => Ok(Self::CidrBlocks),
            _ => Err(format!("invalid set type: {s}")),
        }
    }
}

impl Display for SetType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Unknown => "UNKNOWN",
            Self::NameSpace => "NAMESPACE",
            Self::KeyLabelOfNameSpace => "KEYLABELOFNAMESPACE",
            Self::KeyValueLabelOfNameSpace => "KEYVALUELABELOFNAMESPACE",
            Self::KeyLabelOfPod => "KEYLABELOFPOD",
            Self::KeyValueLabelOfPod => "KEYVALUELABELOFPOD",
            Self::NamedPorts => "NAMEDPORTS",
            Self::NestedLabelOfPod => "NESTEDLABELOFPOD",
            Self::CidrBlocks => "CIDRBLOCKS",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hashed_name_is_fnv1a() {
        // FNV-1a of the empty input is the offset basis.
        assert_eq!(hashed_name(""), "azure-npm-2166136261");
        assert_eq!(hashed_name("a"), "azure-npm-3826002220");
        assert_eq!(hashed_name("ns-default"), hashed_name("ns-default"));
        assert_ne!(hashed_name("ns-default"), hashed_name("ns-kube-system"));
    }

    #[test]
    fn kind_follows_type() {
        assert_eq!(SetType::NameSpace.kind(), SetKind::Hash);
        assert_eq!(SetType::CidrBlocks.kind(), SetKind::Hash);
        assert_eq!(SetType::Unknown.kind(), SetKind::Hash);
        assert_eq!(SetType::KeyLabelOfNameSpace.kind(), SetKind::List);
        assert_eq!(SetType::NestedLabelOfPod.kind(), SetKind::List);
    }

    #[test]
    fn set_type_wire_names() {
        let s = serde_json::to_string(&SetType::KeyValueLabelOfPod).unwrap();
        assert_eq!(s, "\"KEYVALUELABELOFPOD\"");
        assert_eq!(
            "cidrblocks".parse::<SetType>().unwrap(),
            SetType::CidrBlocks
        );
    }
}
