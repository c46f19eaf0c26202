// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Object store access for the download path.

use std::{fmt, io, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use object_store::{ObjectStore, PutPayload, local::LocalFileSystem, memory::InMemory, path::Path};
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use snafu::ResultExt;

use crate::error::{
    ConfigError, ObjectNotFoundSnafu, StorageBackendSnafu, StorageError, StorageRootSnafu,
};

/// Body bytes of one stored object.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// One object of a download request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ObjectDescriptor {
    pub storage_key:  String,
    pub display_name: String,
    pub size:         u64,
}

#[async_trait]
pub trait Storage: Send + Sync + fmt::Debug {
    async fn open_read_stream(&self, key: &str) -> Result<ByteStream, StorageError>;

    async fn size(&self, key: &str) -> Result<u64, StorageError>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, SmartDefault)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageConfig {
    /// Volatile store, for development and tests.
    #[default]
    Memory,
    /// Objects are files below `root`, keyed by relative path.
    Local { root: PathBuf },
}

impl StorageConfig {
    pub fn build(&self) -> Result<ObjectStoreStorage, ConfigError> {
        match self {
            Self::Memory => Ok(ObjectStoreStorage::in_memory()),
            Self::Local { root } => {
                let path = root.display().to_string();
                std::fs::create_dir_all(root).context(StorageRootSnafu { path: path.clone() })?;
                let root = root.canonicalize().context(StorageRootSnafu { path })?;
                let store = LocalFileSystem::new_with_prefix(root).context(StorageBackendSnafu)?;
                Ok(ObjectStoreStorage::new(Arc::new(store)))
            }
        }
    }
}

/// [`Storage`] over any `object_store` backend.
#[derive(Debug, Clone)]
pub struct ObjectStoreStorage {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreStorage {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self { Self { store } }

    #[must_use]
    pub fn in_memory() -> Self { Self::new(Arc::new(InMemory::new())) }

    pub async fn put(&self, key: &str, bytes: impl Into<Bytes>) -> Result<(), StorageError> {
        self.store
            .put(&Path::from(key), PutPayload::from(bytes.into()))
            .await
            .map_err(|error| classify(key, error))?;
        Ok(())
    }
}

fn classify(key: &str, error: object_store::Error) -> StorageError {
    match error {
        object_store::Error::NotFound { .. } => ObjectNotFoundSnafu { key }.build(),
        other => StorageError::Unavailable {
            key:    key.to_string(),
            source: Box::new(other),
        },
    }
}

#[async_trait]
impl Storage for ObjectStoreStorage {
    async fn open_read_stream(&self, key: &str) -> Result<ByteStream, StorageError> {
        let result = self
            .store
            .get(&Path::from(key))
            .await
            .map_err(|error| classify(key, error))?;
        Ok(result.into_stream().map_err(io::Error::other).boxed())
    }

    async fn size(&self, key: &str) -> Result<u64, StorageError> {
        let meta = self
            .store
            .head(&Path::from(key))
            .await
            .map_err(|error| classify(key, error))?;
        Ok(meta.size)
    }
}
