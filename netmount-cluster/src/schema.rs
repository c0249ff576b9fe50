//! Schema sources, models and the repository that builds them.
//!
//! Source text is opaque here: a model is the ordered set of sources it was
//! assembled from. A repository knows some sources locally and can be told
//! where to fetch others; on a slave, the master is registered as that remote
//! provider for every source the device uses.

use crate::error::{MountError, MountResult};
use crate::services::Registration;
use async_trait::async_trait;
use netmount_types::SourceId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Text of one schema source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSource {
    pub id: SourceId,
    pub text: String,
}

impl SchemaSource {
    pub fn new(id: SourceId, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
        }
    }
}

/// A schema model assembled from an ordered list of sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaModel {
    sources: Vec<SchemaSource>,
}

impl SchemaModel {
    pub fn new(sources: Vec<SchemaSource>) -> Self {
        Self { sources }
    }

    pub fn sources(&self) -> &[SchemaSource] {
        &self.sources
    }

    /// Identifiers of the sources, in model order.
    pub fn source_ids(&self) -> Vec<SourceId> {
        self.sources.iter().map(|s| s.id.clone()).collect()
    }

    /// Module names, in model order.
    pub fn modules(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.id.name()).collect()
    }
}

/// Something that can hand out schema source text by identifier.
#[async_trait]
pub trait SchemaSourceProvider: Send + Sync {
    async fn get_source(&self, id: &SourceId) -> MountResult<SchemaSource>;
}

/// A node-local schema repository.
#[async_trait]
pub trait SchemaRepository: SchemaSourceProvider {
    /// Registers `provider` as a remote origin of `id`. The source stays
    /// available until the returned registration is closed.
    fn register_source(
        &self,
        id: SourceId,
        provider: Arc<dyn SchemaSourceProvider>,
    ) -> Box<dyn Registration>;

    /// Fetches every listed source and assembles a model from them.
    async fn build_model(&self, sources: &[SourceId]) -> MountResult<SchemaModel>;
}

type ProviderList = Vec<(u64, Arc<dyn SchemaSourceProvider>)>;

#[derive(Default)]
struct RepositoryInner {
    local: RwLock<HashMap<SourceId, String>>,
    remote: RwLock<HashMap<SourceId, ProviderList>>,
    next_token: AtomicU64,
}

/// In-memory repository: local texts plus registered remote providers.
#[derive(Clone, Default)]
pub struct InMemorySchemaRepository {
    inner: Arc<RepositoryInner>,
}

impl InMemorySchemaRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a locally known source.
    pub fn add_source(&self, id: SourceId, text: impl Into<String>) {
        if let Ok(mut local) = self.inner.local.write() {
            local.insert(id, text.into());
        }
    }

    /// Number of live remote-provider registrations.
    pub fn remote_registration_count(&self) -> usize {
        self.inner
            .remote
            .read()
            .map(|remote| remote.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    fn remote_provider(&self, id: &SourceId) -> Option<Arc<dyn SchemaSourceProvider>> {
        let remote = self.inner.remote.read().ok()?;
        remote
            .get(id)
            .and_then(|providers| providers.first())
            .map(|(_, provider)| Arc::clone(provider))
    }
}

#[async_trait]
impl SchemaSourceProvider for InMemorySchemaRepository {
    async fn get_source(&self, id: &SourceId) -> MountResult<SchemaSource> {
        let local = self
            .inner
            .local
            .read()
            .ok()
            .and_then(|local| local.get(id).cloned());
        if let Some(text) = local {
            return Ok(SchemaSource::new(id.clone(), text));
        }

        let provider = self
            .remote_provider(id)
            .ok_or_else(|| MountError::SourceNotFound(id.clone()))?;
        debug!("Fetching schema source {id} from remote provider");
        provider.get_source(id).await
    }
}

#[async_trait]
impl SchemaRepository for InMemorySchemaRepository {
    fn register_source(
        &self,
        id: SourceId,
        provider: Arc<dyn SchemaSourceProvider>,
    ) -> Box<dyn Registration> {
        let token = self.inner.next_token.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut remote) = self.inner.remote.write() {
            remote.entry(id.clone()).or_default().push((token, provider));
        }
        Box::new(SourceRegistration {
            inner: Arc::clone(&self.inner),
            id,
            token,
        })
    }

    async fn build_model(&self, sources: &[SourceId]) -> MountResult<SchemaModel> {
        let fetched = futures::future::try_join_all(sources.iter().map(|id| self.get_source(id)))
            .await
            .map_err(|e| MountError::SchemaResolution {
                source: Box::new(e),
            })?;
        Ok(SchemaModel::new(fetched))
    }
}

struct SourceRegistration {
    inner: Arc<RepositoryInner>,
    id: SourceId,
    token: u64,
}

impl Registration for SourceRegistration {
    fn close(self: Box<Self>) {
        if let Ok(mut remote) = self.inner.remote.write() {
            if let Some(providers) = remote.get_mut(&self.id) {
                providers.retain(|(token, _)| *token != self.token);
                if providers.is_empty() {
                    remote.remove(&self.id);
                }
            }
        }
    }
}
