// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use uuid::Uuid;

/// Endpoints allowed to connect, with their shared keys. Clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct EndpointRegistry {
    endpoints: Arc<RwLock<HashMap<Uuid, String>>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an endpoint, replacing its key if it was already known. Returns the previous
    /// key.
    pub fn add_endpoint(&self, uuid: Uuid, key: impl Into<String>) -> Option<String> {
        self.endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(uuid, key.into())
    }

    pub fn remove_endpoint(&self, uuid: &Uuid) -> bool {
        self.endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(uuid)
            .is_some()
    }

    pub fn key_for(&self, uuid: &Uuid) -> Option<String> {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uuid)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
