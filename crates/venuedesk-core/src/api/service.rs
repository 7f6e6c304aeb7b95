//! Per-entity service contract and its REST implementation.

use std::future::Future;
use std::marker::PhantomData;

use serde::{de::DeserializeOwned, Serialize};

use crate::models::{Entity, ListParams};

use super::client::ApiClient;
use super::error::RawFailure;

/// Create/list/read/update/delete for one entity type.
pub trait EntityService<E>: Send + Sync {
    fn entity(&self) -> Entity;

    fn create<D: Serialize + Sync>(
        &self,
        dto: &D,
    ) -> impl Future<Output = Result<E, RawFailure>> + Send;

    fn list(&self, params: &ListParams) -> impl Future<Output = Result<Vec<E>, RawFailure>> + Send;

    fn get_by_id(&self, id: &str) -> impl Future<Output = Result<E, RawFailure>> + Send;

    fn update<D: Serialize + Sync>(
        &self,
        id: &str,
        dto: &D,
    ) -> impl Future<Output = Result<E, RawFailure>> + Send;

    fn delete(&self, id: &str) -> impl Future<Output = Result<(), RawFailure>> + Send;
}

/// [`EntityService`] backed by the REST API.
pub struct Resource<E> {
    api: ApiClient,
    entity: Entity,
    _marker: PhantomData<fn() -> E>,
}

impl<E> Resource<E> {
    pub fn new(api: ApiClient, entity: Entity) -> Self {
        Self {
            api,
            entity,
            _marker: PhantomData,
        }
    }
}

impl<E> Clone for Resource<E> {
    fn clone(&self) -> Self {
        Self::new(self.api.clone(), self.entity)
    }
}

impl<E> EntityService<E> for Resource<E>
where
    E: DeserializeOwned + Send + 'static,
{
    fn entity(&self) -> Entity {
        self.entity
    }

    fn create<D: Serialize + Sync>(
        &self,
        dto: &D,
    ) -> impl Future<Output = Result<E, RawFailure>> + Send {
        self.api.create(self.entity, dto)
    }

    fn list(&self, params: &ListParams) -> impl Future<Output = Result<Vec<E>, RawFailure>> + Send {
        self.api.list(self.entity, params)
    }

    fn get_by_id(&self, id: &str) -> impl Future<Output = Result<E, RawFailure>> + Send {
        self.api.get_by_id(self.entity, id)
    }

    fn update<D: Serialize + Sync>(
        &self,
        id: &str,
        dto: &D,
    ) -> impl Future<Output = Result<E, RawFailure>> + Send {
        self.api.update(self.entity, id, dto)
    }

    fn delete(&self, id: &str) -> impl Future<Output = Result<(), RawFailure>> + Send {
        self.api.delete(self.entity, id)
    }
}
