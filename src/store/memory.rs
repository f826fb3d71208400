//! In-memory repository for tests and single-node deployments.

use crate::error::{ApiError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use super::{Mutation, Page, Pagination, Predicate, Record, Repository};

/// In-memory repository backed by a `HashMap` behind an `RwLock`.
///
/// Wraps its data in `Arc` for cheap cloning, so several services can share
/// one logical table.
#[derive(Debug)]
pub struct InMemoryRepository<T> {
    inner: Arc<RwLock<HashMap<Uuid, T>>>,
}

impl<T> Clone for InMemoryRepository<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for InMemoryRepository<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<T: Record> InMemoryRepository<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn sorted_matches(&self, filter: Predicate<'_, T>) -> Vec<T> {
        let map = self.inner.read().unwrap();
        let mut matches: Vec<T> = map.values().filter(|r| filter(r)).cloned().collect();
        // Newest first; id breaks ties so pagination is deterministic.
        matches.sort_by(|a, b| {
            b.created_at()
                .cmp(&a.created_at())
                .then_with(|| a.id().cmp(&b.id()))
        });
        matches
    }
}

#[async_trait]
impl<T: Record> Repository<T> for InMemoryRepository<T> {
    async fn create(&self, record: T) -> Result<T> {
        let mut map = self.inner.write().unwrap();
        if map.contains_key(&record.id()) {
            return Err(ApiError::validation("Duplicate value entered"));
        }
        map.insert(record.id(), record.clone());
        Ok(record)
    }

    async fn get(&self, id: Uuid) -> Result<Option<T>> {
        Ok(self.inner.read().unwrap().get(&id).cloned())
    }

    async fn find_one(&self, filter: Predicate<'_, T>) -> Result<Option<T>> {
        Ok(self.sorted_matches(filter).into_iter().next())
    }

    async fn find(&self, filter: Predicate<'_, T>, pagination: Pagination) -> Result<Page<T>> {
        let matches = self.sorted_matches(filter);
        let total = matches.len();
        let skip = pagination.page.saturating_sub(1).saturating_mul(pagination.limit);
        let data = matches
            .into_iter()
            .skip(skip)
            .take(pagination.limit)
            .collect();
        Ok(Page {
            data,
            total,
            page: pagination.page,
            limit: pagination.limit,
        })
    }

    async fn update_with(&self, id: Uuid, apply: Mutation<T>) -> Result<T> {
        let mut map = self.inner.write().unwrap();
        let record = map
            .get_mut(&id)
            .ok_or_else(|| ApiError::not_found("Document not found"))?;

        // Mutate a copy so a failed mutation leaves the stored record intact.
        let mut updated = record.clone();
        apply(&mut updated)?;
        *record = updated.clone();
        Ok(updated)
    }

    async fn delete(&self, id: Uuid) -> Result<T> {
        self.inner
            .write()
            .unwrap()
            .remove(&id)
            .ok_or_else(|| ApiError::not_found("Document not found"))
    }

    async fn bulk_create(&self, records: Vec<T>) -> Result<Vec<T>> {
        let mut map = self.inner.write().unwrap();
        for record in &records {
            if map.contains_key(&record.id()) {
                return Err(ApiError::validation("Duplicate value entered"));
            }
        }
        for record in &records {
            map.insert(record.id(), record.clone());
        }
        Ok(records)
    }

    async fn exists(&self, filter: Predicate<'_, T>) -> Result<bool> {
        let map = self.inner.read().unwrap();
        Ok(map.values().any(|r| filter(r)))
    }

    async fn count(&self, filter: Predicate<'_, T>) -> Result<usize> {
        let map = self.inner.read().unwrap();
        Ok(map.values().filter(|r| filter(r)).count())
    }
}
