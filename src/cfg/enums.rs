// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use serde::{Deserialize, Serialize};

/// Serde adapter for config booleans written in the wire style.
///
/// The gateway-facing config uses "Yes"/"No" the way the protocol headers
/// do; plain YAML booleans and 0/1 are accepted too. Values serialize back
/// as "Yes"/"No" so a round-tripped config stays in the same dialect.
pub mod yes_no {
    use core::fmt;

    use serde::{Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(value: &bool, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(if *value { "Yes" } else { "No" })
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<bool, D::Error> {
        struct YesNoVisitor;

        impl de::Visitor<'_> for YesNoVisitor {
            type Value = bool;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(r#""Yes", "No", a boolean, or 0/1"#)
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<bool, E> {
                Ok(v)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<bool, E> {
                match v {
                    0 => Ok(false),
                    1 => Ok(true),
                    other => Err(E::custom(format!("expected 0 or 1, got {other}"))),
                }
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<bool, E> {
                if v.eq_ignore_ascii_case("yes")
                    || v.eq_ignore_ascii_case("true")
                    || v == "1"
                {
                    Ok(true)
                } else if v.eq_ignore_ascii_case("no")
                    || v.eq_ignore_ascii_case("false")
                    || v == "0"
                {
                    Ok(false)
                } else {
                    Err(E::custom(format!("expected Yes or No, got {v:?}")))
                }
            }
        }

        de.deserialize_any(YesNoVisitor)
    }
}

/// Server certificate verification strategy for the HTTPS/CSTP connection.
///
/// VPN gateways commonly run operator-issued certificates, so besides the
/// platform trust store the client supports an explicit CA bundle, a
/// SHA-256 fingerprint pin, and (for lab use only) no verification at all.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(tag = "Mode")]
pub enum TlsVerify {
    #[default]
    #[serde(rename = "System")]
    System,
    #[serde(rename = "CaFile")]
    CaFile {
        #[serde(rename = "Path")]
        path: String,
    },
    #[serde(rename = "Pin")]
    Pin {
        /// Hex-encoded SHA-256 digest of the server certificate (DER).
        #[serde(rename = "Sha256")]
        sha256: String,
    },
    #[serde(rename = "Insecure")]
    Insecure,
}
