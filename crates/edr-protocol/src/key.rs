// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Length of keys handed out to endpoints
pub const DEFAULT_KEY_SIZE: usize = 64;

/// Generates a random alphanumeric key suitable for an endpoint or a manager.
pub fn generate_key(size: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(size)
        .map(char::from)
        .collect()
}
