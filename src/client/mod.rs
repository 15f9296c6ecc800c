// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod compress;
pub mod cstp;
pub mod dtls;
pub mod engine;
pub mod queues;
pub mod session;
pub mod tls;
pub mod tun_dev;
