//! Write operations with cache invalidation.
//!
//! A mutation runs the service call, then, only on success, invalidates every
//! cached view the write can affect before returning. A caller that awaited
//! `mutate` never reads pre-write data from the cache afterwards.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::api::{classify, ErrorRecord, RawFailure};
use crate::models::Entity;

use super::cache::QueryCache;
use super::invalidation::{InvalidationRules, Operation};

/// Describes one write. The affected keys are derived from it, never passed in.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationDescriptor {
    pub entity: Entity,
    pub operation: Operation,
    pub payload: Value,
    pub default_message: Option<String>,
}

impl MutationDescriptor {
    pub fn new(entity: Entity, operation: Operation, payload: Value) -> Self {
        Self {
            entity,
            operation,
            payload,
            default_message: None,
        }
    }

    /// Build from a typed DTO. A DTO that does not serialize yields a
    /// payload of `null`, which still invalidates every list of the entity.
    pub fn for_dto<D: Serialize>(entity: Entity, operation: Operation, dto: &D) -> Self {
        let payload = serde_json::to_value(dto).unwrap_or(Value::Null);
        Self::new(entity, operation, payload)
    }

    pub fn create<D: Serialize>(entity: Entity, dto: &D) -> Self {
        Self::for_dto(entity, Operation::Create, dto)
    }

    /// Update of `id`; the id is merged into the payload for key resolution.
    pub fn update<D: Serialize>(entity: Entity, id: &str, dto: &D) -> Self {
        Self::for_dto(entity, Operation::Update, dto).with_field("id", id)
    }

    pub fn delete(entity: Entity, id: &str) -> Self {
        Self::new(entity, Operation::Delete, serde_json::json!({ "id": id }))
    }

    /// Message used when the failure carries none.
    pub fn with_default_message(mut self, message: impl Into<String>) -> Self {
        self.default_message = Some(message.into());
        self
    }

    /// Add a parent or related id the DTO does not carry (e.g. the venue of
    /// a deleted contract).
    pub fn with_field(mut self, field: &str, value: impl Into<Value>) -> Self {
        if !self.payload.is_object() {
            self.payload = Value::Object(Default::default());
        }
        if let Value::Object(map) = &mut self.payload {
            map.insert(field.to_string(), value.into());
        }
        self
    }
}

/// Runs writes and drives invalidation.
#[derive(Debug, Clone)]
pub struct MutationPipeline {
    cache: QueryCache,
    rules: Arc<InvalidationRules>,
}

impl MutationPipeline {
    pub fn new(cache: QueryCache, rules: InvalidationRules) -> Self {
        Self {
            cache,
            rules: Arc::new(rules),
        }
    }

    pub fn rules(&self) -> &InvalidationRules {
        &self.rules
    }

    /// Run `service_call` for `descriptor`.
    ///
    /// On success every live cache key covered by the resolved patterns is
    /// invalidated before this returns. On failure the raw error is
    /// classified and nothing is invalidated. Concurrent mutations are not
    /// serialized.
    pub async fn mutate<T, F, Fut>(
        &self,
        descriptor: &MutationDescriptor,
        service_call: F,
    ) -> Result<T, ErrorRecord>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RawFailure>>,
    {
        debug!(
            entity = %descriptor.entity,
            operation = %descriptor.operation,
            "Running mutation"
        );

        match service_call().await {
            Ok(output) => {
                let patterns = self.rules.resolve(
                    descriptor.entity,
                    descriptor.operation,
                    &descriptor.payload,
                );
                let invalidated: usize = patterns
                    .iter()
                    .map(|pattern| self.cache.invalidate_matching(pattern))
                    .sum();
                info!(
                    entity = %descriptor.entity,
                    operation = %descriptor.operation,
                    invalidated,
                    "Mutation succeeded"
                );
                Ok(output)
            }
            Err(raw) => {
                let default_message = descriptor
                    .default_message
                    .as_deref()
                    .unwrap_or(self.cache.config().default_error_message.as_str());
                let record = classify(&raw, default_message);
                warn!(
                    entity = %descriptor.entity,
                    operation = %descriptor.operation,
                    kind = %record.kind,
                    "Mutation failed"
                );
                Err(record)
            }
        }
    }
}
