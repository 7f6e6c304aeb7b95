//! Session-scoped entry point tying the cache, mutations and search together.
//!
//! One [`SyncStore`] lives for one authenticated session. Views read through
//! [`SyncStore::list`]/[`SyncStore::get`], writes go through
//! [`SyncStore::create`]/[`SyncStore::update`]/[`SyncStore::delete`], and
//! [`SyncStore::end_session`] drops everything on logout.

use std::future::Future;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::info;

use crate::api::{classify, EntityService, ErrorRecord, RawFailure};
use crate::config::SyncConfig;
use crate::models::ListParams;
use crate::sync::{
    loader, CacheEntry, DebouncedSearch, InvalidationRules, Loader, MutationDescriptor,
    MutationPipeline, QueryCache, QueryKey, Subscription,
};

/// Loader for the list view of `service` under `params`.
pub fn list_loader<E, S>(service: Arc<S>, params: ListParams) -> Loader
where
    S: EntityService<E> + 'static,
    E: Serialize + Send + 'static,
{
    loader(move || {
        let service = Arc::clone(&service);
        let params = params.clone();
        async move { service.list(&params).await }
    })
}

/// Loader for the detail view of `id`.
pub fn detail_loader<E, S>(service: Arc<S>, id: String) -> Loader
where
    S: EntityService<E> + 'static,
    E: Serialize + Send + 'static,
{
    loader(move || {
        let service = Arc::clone(&service);
        let id = id.clone();
        async move { service.get_by_id(&id).await }
    })
}

#[derive(Debug, Clone)]
pub struct SyncStore {
    cache: QueryCache,
    pipeline: MutationPipeline,
}

impl SyncStore {
    pub fn new(config: SyncConfig) -> Self {
        Self::with_rules(config, InvalidationRules::default())
    }

    pub fn with_rules(config: SyncConfig, rules: InvalidationRules) -> Self {
        let cache = QueryCache::new(config);
        let pipeline = MutationPipeline::new(cache.clone(), rules);
        Self { cache, pipeline }
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn config(&self) -> &SyncConfig {
        self.cache.config()
    }

    pub fn subscribe(&self, key: &QueryKey) -> Subscription {
        self.cache.subscribe(key)
    }

    pub fn snapshot(&self, key: &QueryKey) -> CacheEntry {
        self.cache.snapshot(key)
    }

    pub async fn fetch(&self, key: &QueryKey, loader: Loader) -> Result<Value, ErrorRecord> {
        self.cache.fetch(key, loader).await
    }

    pub fn invalidate(&self, key: &QueryKey) -> bool {
        self.cache.invalidate(key)
    }

    pub async fn mutate<T, F, Fut>(
        &self,
        descriptor: &MutationDescriptor,
        service_call: F,
    ) -> Result<T, ErrorRecord>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RawFailure>>,
    {
        self.pipeline.mutate(descriptor, service_call).await
    }

    /// Debounced search whose commits fetch the key and loader `build`
    /// returns, using the configured quiet period.
    pub fn search<F>(&self, build: F) -> DebouncedSearch
    where
        F: Fn(&str) -> (QueryKey, Loader) + Send + Sync + 'static,
    {
        DebouncedSearch::for_query(self.cache.clone(), self.config().debounce, build)
    }

    /// Debounced search over the list view of `service`, scoped to `parent_id`.
    pub fn search_list<E, S>(&self, service: Arc<S>, parent_id: Option<String>) -> DebouncedSearch
    where
        S: EntityService<E> + 'static,
        E: Serialize + Send + 'static,
    {
        let entity = service.entity();
        self.search(move |term| {
            let params = ListParams {
                parent_id: parent_id.clone(),
                search: term.to_string(),
            };
            (
                QueryKey::list(entity, &params),
                list_loader::<E, S>(Arc::clone(&service), params),
            )
        })
    }

    /// Drop every cached entry. Called on logout.
    pub fn end_session(&self) {
        self.cache.clear();
        info!("Session ended, cache cleared");
    }

    // ===== Typed views =====

    pub async fn list<E, S>(&self, service: &Arc<S>, params: &ListParams) -> Result<Vec<E>, ErrorRecord>
    where
        S: EntityService<E> + 'static,
        E: Serialize + DeserializeOwned + Send + 'static,
    {
        let key = QueryKey::list(service.entity(), params);
        let value = self
            .fetch(&key, list_loader::<E, S>(Arc::clone(service), params.clone()))
            .await?;
        self.decode(value)
    }

    pub async fn get<E, S>(&self, service: &Arc<S>, id: &str) -> Result<E, ErrorRecord>
    where
        S: EntityService<E> + 'static,
        E: Serialize + DeserializeOwned + Send + 'static,
    {
        let key = QueryKey::detail(service.entity(), id);
        let value = self
            .fetch(&key, detail_loader::<E, S>(Arc::clone(service), id.to_string()))
            .await?;
        self.decode(value)
    }

    fn decode<T: DeserializeOwned>(&self, value: Value) -> Result<T, ErrorRecord> {
        serde_json::from_value(value)
            .map_err(|e| classify(&RawFailure::decode(e), &self.config().default_error_message))
    }

    // ===== Typed writes =====

    pub async fn create<E, S, D>(&self, service: &S, dto: &D) -> Result<E, ErrorRecord>
    where
        S: EntityService<E>,
        D: Serialize + Sync,
    {
        let descriptor = MutationDescriptor::create(service.entity(), dto);
        self.mutate(&descriptor, || service.create(dto)).await
    }

    pub async fn update<E, S, D>(&self, service: &S, id: &str, dto: &D) -> Result<E, ErrorRecord>
    where
        S: EntityService<E>,
        D: Serialize + Sync,
    {
        let descriptor = MutationDescriptor::update(service.entity(), id, dto);
        self.mutate(&descriptor, || service.update(id, dto)).await
    }

    /// Delete `id`. Without the parent id every list of the entity is
    /// invalidated; use [`SyncStore::mutate`] with a scoped descriptor to
    /// narrow it.
    pub async fn delete<E, S>(&self, service: &S, id: &str) -> Result<(), ErrorRecord>
    where
        S: EntityService<E>,
    {
        let descriptor = MutationDescriptor::delete(service.entity(), id);
        self.mutate(&descriptor, || service.delete(id)).await
    }
}
