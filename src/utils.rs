// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fmt::Write;

use rand::RngExt;

/// Generates the client's 48-byte DTLS master secret and returns:
/// - `[u8; 48]` kept for the PSK handshake
/// - `String` containing its hexadecimal representation for the
///   `X-DTLS-Master-Secret` request header
pub fn generate_dtls_secret() -> ([u8; 48], String) {
    let mut secret = [0u8; 48];
    rand::rng().fill(&mut secret);

    let mut hex = String::with_capacity(96);
    for byte in &secret {
        write!(&mut hex, "{byte:02x}").expect("Writing to String cannot fail");
    }

    (secret, hex)
}
