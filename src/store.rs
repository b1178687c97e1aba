// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;

use crate::mesh::ResourceKey;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Secret {
    pub data: Bytes,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("resource {0} already exists")]
    AlreadyExists(ResourceKey),
    #[error("resource {0} not found")]
    NotFound(ResourceKey),
}

/// SecretStore persists key material on behalf of CA backends. The storage format is owned by
/// the store; callers only see opaque secrets.
#[async_trait]
pub trait SecretStore: Send + Sync + Debug {
    async fn get(&self, key: &ResourceKey) -> Result<Option<Secret>, Error>;

    /// Creates the secret, failing with [`Error::AlreadyExists`] if it is already present.
    async fn create(&self, key: &ResourceKey, secret: Secret) -> Result<(), Error>;

    async fn delete(&self, key: &ResourceKey) -> Result<(), Error>;
}

/// MemoryStore keeps secrets in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    secrets: RwLock<HashMap<ResourceKey, Secret>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretStore for MemoryStore {
    async fn get(&self, key: &ResourceKey) -> Result<Option<Secret>, Error> {
        Ok(self.secrets.read().unwrap().get(key).cloned())
    }

    async fn create(&self, key: &ResourceKey, secret: Secret) -> Result<(), Error> {
        let mut secrets = self.secrets.write().unwrap();
        if secrets.contains_key(key) {
            return Err(Error::AlreadyExists(key.clone()));
        }
        secrets.insert(key.clone(), secret);
        Ok(())
    }

    async fn delete(&self, key: &ResourceKey) -> Result<(), Error> {
        match self.secrets.write().unwrap().remove(key) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound(key.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_is_exclusive() {
        let store = MemoryStore::new();
        let key = ResourceKey::new("default", "default.ca-builtin-cert-ca-1");
        assert_eq!(store.get(&key).await.unwrap(), None);

        let secret = Secret {
            data: Bytes::from_static(b"root"),
        };
        store.create(&key, secret.clone()).await.unwrap();
        assert!(matches!(
            store.create(&key, secret.clone()).await,
            Err(Error::AlreadyExists(_))
        ));
        assert_eq!(store.get(&key).await.unwrap(), Some(secret));

        store.delete(&key).await.unwrap();
        assert!(matches!(store.delete(&key).await, Err(Error::NotFound(_))));
    }
}
