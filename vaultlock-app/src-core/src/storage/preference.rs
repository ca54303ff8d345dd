use std::marker::PhantomData;
use std::sync::Arc;

use futures::stream::{BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use super::encrypted::EncryptedKeyValueStore;
use crate::error::{VaultError, VaultResult};

/// A single typed value inside an [`EncryptedKeyValueStore`].
pub struct Preference<T> {
    store: Arc<EncryptedKeyValueStore>,
    key: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Preference<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            key: self.key,
            _marker: PhantomData,
        }
    }
}

impl<T> Preference<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    pub fn new(store: Arc<EncryptedKeyValueStore>, key: &'static str) -> Self {
        Self {
            store,
            key,
            _marker: PhantomData,
        }
    }

    pub fn key(&self) -> &'static str {
        self.key
    }

    /// Stored value, or an error when it no longer parses as `T`.
    pub async fn get(&self) -> VaultResult<Option<T>> {
        match self.store.get(self.key).await? {
            Some(value) => self.decode(value).map(Some),
            None => Ok(None),
        }
    }

    pub async fn set(&self, value: &T) -> VaultResult<()> {
        self.store.set(self.key, serde_json::to_value(value)?).await
    }

    pub async fn set_and_commit(&self, value: &T) -> VaultResult<()> {
        self.store
            .set_and_commit(self.key, serde_json::to_value(value)?)
            .await
    }

    pub async fn remove(&self) -> VaultResult<()> {
        self.store.remove(self.key).await
    }

    pub async fn remove_and_commit(&self) -> VaultResult<()> {
        self.store.remove_and_commit(self.key).await
    }

    /// Typed view of [`EncryptedKeyValueStore::watch`]. A value that does not
    /// parse is logged and surfaces as `None`.
    pub async fn watch(&self) -> VaultResult<BoxStream<'static, Option<T>>> {
        let key = self.key;
        let values = self.store.watch(key).await?;
        Ok(values
            .map(move |value| {
                value.and_then(|v| match serde_json::from_value(v) {
                    Ok(parsed) => Some(parsed),
                    Err(e) => {
                        warn!("Ignoring malformed value under {}: {}", key, e);
                        None
                    }
                })
            })
            .boxed())
    }

    fn decode(&self, value: serde_json::Value) -> VaultResult<T> {
        serde_json::from_value(value).map_err(|e| {
            VaultError::Corrupted(format!(
                "{} in store {} is malformed: {}",
                self.key,
                self.store.file(),
                e
            ))
        })
    }
}
