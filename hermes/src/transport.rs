// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::fmt;

/// Valid transport types (i.e. transport types supported by the native
/// layer's plugin interface). Which of these a given build can actually
/// drive is decided at native initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    BmiTcp,
    MpiDynamic,
    MpiStatic,
    NaSm,
    CciTcp,
    CciVerbs,
    CciGni,
    CciSm,
    OfiTcp,
    OfiPsm2,
    OfiVerbs,
    OfiGni,
}

impl Transport {
    /// The URI scheme, without the `://` separator.
    pub fn scheme(self) -> &'static str {
        match self {
            Self::BmiTcp => "bmi+tcp",
            Self::MpiDynamic => "mpi+dynamic",
            Self::MpiStatic => "mpi+static",
            Self::NaSm => "na+sm",
            Self::CciTcp => "cci+tcp",
            Self::CciVerbs => "cci+verbs",
            Self::CciGni => "cci+gni",
            Self::CciSm => "cci+sm",
            Self::OfiTcp => "ofi+tcp",
            Self::OfiPsm2 => "ofi+psm2",
            Self::OfiVerbs => "ofi+verbs",
            Self::OfiGni => "ofi+gni",
        }
    }

    /// The prefix used when binding the native layer.
    pub fn uri_prefix(self) -> String {
        format!("{}://", self.scheme())
    }

    /// The prefix prepended to unqualified addresses in `lookup`. For OFI
    /// verbs this is the RX-manager form the native layer resolves.
    pub fn lookup_prefix(self) -> String {
        match self {
            Self::OfiVerbs => "ofi+verbs;ofi_rxm://".to_string(),
            other => other.uri_prefix(),
        }
    }

    /// Whether an address carrying `scheme` may be looked up on an engine
    /// configured for this transport.
    pub fn matches_scheme(self, scheme: &str) -> bool {
        if scheme == self.scheme() {
            return true;
        }

        // verbs accepts the extended RX-manager form
        self == Self::OfiVerbs && scheme == "ofi+verbs;ofi_rxm"
    }

    pub fn from_scheme(scheme: &str) -> Option<Transport> {
        let t = match scheme {
            "bmi+tcp" => Self::BmiTcp,
            "mpi+dynamic" => Self::MpiDynamic,
            "mpi+static" => Self::MpiStatic,
            "na+sm" => Self::NaSm,
            "cci+tcp" => Self::CciTcp,
            "cci+verbs" => Self::CciVerbs,
            "cci+gni" => Self::CciGni,
            "cci+sm" => Self::CciSm,
            "ofi+tcp" => Self::OfiTcp,
            "ofi+psm2" => Self::OfiPsm2,
            "ofi+verbs" | "ofi+verbs;ofi_rxm" => Self::OfiVerbs,
            "ofi+gni" => Self::OfiGni,
            _ => return None,
        };
        Some(t)
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.scheme())
    }
}
