//! In-memory object storage.

use std::collections::BTreeMap;

use tokio::sync::Mutex;

use super::{FaultPlan, SimOp};
use crate::error::{InfraError, InfraResult};
use crate::traits::{InfraFuture, ObjectStore};
use crate::types::{Credential, PutReceipt};

/// Buckets keyed by destination URI. When constructed with
/// [`MemoryObjectStore::requiring`], every call must present that secret.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<(String, String), Vec<u8>>>,
    required_secret: Option<String>,
    faults: FaultPlan,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that rejects any credential other than `secret`.
    pub fn requiring(secret: &str) -> Self {
        Self {
            required_secret: Some(secret.to_string()),
            ..Self::default()
        }
    }

    pub fn faults(&self) -> &FaultPlan {
        &self.faults
    }

    /// Keys stored under `uri`.
    pub async fn keys(&self, uri: &str) -> Vec<String> {
        self.objects
            .lock()
            .await
            .keys()
            .filter(|(u, _)| u == uri)
            .map(|(_, k)| k.clone())
            .collect()
    }

    fn authorize(&self, credential: &Credential) -> InfraResult<()> {
        match &self.required_secret {
            Some(secret) if secret != credential.expose() => {
                Err(InfraError::rejected("access denied"))
            }
            _ => Ok(()),
        }
    }
}

impl ObjectStore for MemoryObjectStore {
    fn put<'a>(
        &'a self,
        uri: &'a str,
        key: &'a str,
        data: &'a [u8],
        credential: &'a Credential,
    ) -> InfraFuture<'a, PutReceipt> {
        Box::pin(async move {
            self.faults.check(SimOp::Put).await?;
            self.authorize(credential)?;
            self.objects
                .lock()
                .await
                .insert((uri.to_string(), key.to_string()), data.to_vec());
            Ok(PutReceipt {
                key: key.to_string(),
                size_bytes: data.len() as u64,
                durable: true,
            })
        })
    }

    fn get<'a>(
        &'a self,
        uri: &'a str,
        key: &'a str,
        credential: &'a Credential,
    ) -> InfraFuture<'a, Vec<u8>> {
        Box::pin(async move {
            self.faults.check(SimOp::Get).await?;
            self.authorize(credential)?;
            self.objects
                .lock()
                .await
                .get(&(uri.to_string(), key.to_string()))
                .cloned()
                .ok_or_else(|| InfraError::not_found(format!("{uri}/{key}")))
        })
    }

    fn list<'a>(
        &'a self,
        uri: &'a str,
        prefix: &'a str,
        credential: &'a Credential,
    ) -> InfraFuture<'a, Vec<String>> {
        Box::pin(async move {
            self.faults.check(SimOp::List).await?;
            self.authorize(credential)?;
            Ok(self
                .keys(uri)
                .await
                .into_iter()
                .filter(|k| k.starts_with(prefix))
                .collect())
        })
    }

    fn delete<'a>(
        &'a self,
        uri: &'a str,
        key: &'a str,
        credential: &'a Credential,
    ) -> InfraFuture<'a, ()> {
        Box::pin(async move {
            self.faults.check(SimOp::Delete).await?;
            self.authorize(credential)?;
            self.objects
                .lock()
                .await
                .remove(&(uri.to_string(), key.to_string()));
            Ok(())
        })
    }
}
