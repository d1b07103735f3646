//! Node-local delivery filtering.
//!
//! A shared subscription may be broader than any one listener needs, so each
//! listener's `FilterSet` is evaluated against every envelope. Allow-lists
//! are conjunctive across fields and disjunctive within a field; an empty
//! list admits everything.

use std::time::Duration;

use dashmap::DashMap;
use tether_types::delivery::{EventEnvelope, FilterSet, ResourceFilter};
use tokio::time::Instant;

use super::expression::FilterEvaluator;
use super::provider::BoxWebhookProvider;

#[derive(Debug, Clone)]
struct CachedResource {
    name: Option<String>,
    expires_at: Instant,
}

/// Evaluates `FilterSet`s, resolving id-based resource filters through the
/// provider with a TTL cache.
pub struct FilterEngine {
    evaluator: FilterEvaluator,
    /// (provider, attribute, id) -> resolved name.
    resource_cache: DashMap<(String, String, String), CachedResource>,
    cache_ttl: Duration,
}

impl FilterEngine {
    pub fn new(cache_ttl: Duration) -> Self {
        Self {
            evaluator: FilterEvaluator::new(),
            resource_cache: DashMap::new(),
            cache_ttl,
        }
    }

    /// Whether `envelope` passes every predicate in `filters`.
    pub async fn matches(
        &self,
        filters: &FilterSet,
        envelope: &EventEnvelope,
        provider: &BoxWebhookProvider,
    ) -> bool {
        if !allowed(&filters.event_types, Some(&envelope.event_type))
            || !allowed(&filters.statuses, envelope.status.as_ref())
            || !allowed(&filters.categories, envelope.category.as_ref())
            || !allowed(&filters.sources, envelope.source.as_ref())
        {
            return false;
        }

        for resource in &filters.resources {
            if !self.resource_matches(resource, envelope, provider).await {
                return false;
            }
        }

        match &filters.when {
            Some(expression) => {
                match self
                    .evaluator
                    .evaluate_bool(expression, &envelope.to_eval_context())
                {
                    Ok(matched) => matched,
                    Err(e) => {
                        tracing::debug!(expression = %expression, error = %e, "when clause did not evaluate; treating as no match");
                        false
                    }
                }
            }
            None => true,
        }
    }

    async fn resource_matches(
        &self,
        filter: &ResourceFilter,
        envelope: &EventEnvelope,
        provider: &BoxWebhookProvider,
    ) -> bool {
        let Some(actual) = envelope.attributes.get(&filter.attribute) else {
            return false;
        };
        if !filter.by_id {
            return actual == &filter.value;
        }
        match self.resolve(provider, &filter.attribute, &filter.value).await {
            Some(name) => actual == &name,
            None => false,
        }
    }

    async fn resolve(
        &self,
        provider: &BoxWebhookProvider,
        attribute: &str,
        id: &str,
    ) -> Option<String> {
        let key = (
            provider.name().to_string(),
            attribute.to_string(),
            id.to_string(),
        );
        if let Some(cached) = self.resource_cache.get(&key) {
            if cached.expires_at > Instant::now() {
                return cached.name.clone();
            }
        }

        let name = match provider.resolve_resource(attribute, id).await {
            Ok(name) => name,
            Err(e) => {
                // Not cached, so the next delivery retries.
                tracing::debug!(attribute, id, error = %e, "resource lookup failed");
                return None;
            }
        };
        self.resource_cache.insert(
            key,
            CachedResource {
                name: name.clone(),
                expires_at: Instant::now() + self.cache_ttl,
            },
        );
        name
    }
}

fn allowed(list: &[String], value: Option<&String>) -> bool {
    list.is_empty() || value.is_some_and(|v| list.contains(v))
}
