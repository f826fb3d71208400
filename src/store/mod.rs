//! Persistence layer: generic CRUD over typed records.
//!
//! [`Repository`] is the storage seam every service consumes. The in-memory
//! implementation backs tests and single-node deployments; a database-backed
//! implementation slots in behind the same trait. Filters are plain
//! predicates and updates are closures applied atomically under the store's
//! write path, which is what domain stores build their conditional updates on.

mod memory;

pub use memory::InMemoryRepository;

use crate::error::Result;
use async_trait::async_trait;
use uuid::Uuid;

/// A persistable record with a stable identity.
pub trait Record: Clone + Send + Sync + 'static {
    fn id(&self) -> Uuid;

    /// Creation timestamp (unix seconds); default sort key for listings.
    fn created_at(&self) -> u64;
}

/// Page request. Pages are 1-based, matching the API surface.
#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    pub page: usize,
    pub limit: usize,
}

impl Pagination {
    #[must_use]
    pub fn new(page: usize, limit: usize) -> Self {
        Self {
            page: page.max(1),
            limit,
        }
    }

    /// A single page holding every matching record.
    #[must_use]
    pub fn all() -> Self {
        Self {
            page: 1,
            limit: usize::MAX,
        }
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self { page: 1, limit: 10 }
    }
}

/// One page of results plus the total match count.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub limit: usize,
}

/// Borrowed predicate over records.
pub type Predicate<'a, T> = &'a (dyn Fn(&T) -> bool + Send + Sync);

/// Owned mutation applied to a record under the store's write path.
///
/// Returning an error aborts the update without persisting anything, which
/// is how conditional updates (version checks, one-way flags) are expressed.
pub type Mutation<T> = Box<dyn FnOnce(&mut T) -> Result<()> + Send>;

/// Generic CRUD operations over one record type.
#[async_trait]
pub trait Repository<T: Record>: Send + Sync {
    /// Insert a new record. Fails on duplicate id.
    async fn create(&self, record: T) -> Result<T>;

    /// Fetch by id.
    async fn get(&self, id: Uuid) -> Result<Option<T>>;

    /// First record matching the predicate (newest first).
    async fn find_one(&self, filter: Predicate<'_, T>) -> Result<Option<T>>;

    /// Matching records, newest first, paginated.
    async fn find(&self, filter: Predicate<'_, T>, pagination: Pagination) -> Result<Page<T>>;

    /// Apply a mutation to the record atomically. Fails with `NotFound` if
    /// the record doesn't exist; a mutation error leaves the record untouched.
    async fn update_with(&self, id: Uuid, apply: Mutation<T>) -> Result<T>;

    /// Remove and return a record.
    async fn delete(&self, id: Uuid) -> Result<T>;

    /// Insert many records.
    async fn bulk_create(&self, records: Vec<T>) -> Result<Vec<T>>;

    /// Whether any record matches.
    async fn exists(&self, filter: Predicate<'_, T>) -> Result<bool>;

    /// Number of matching records.
    async fn count(&self, filter: Predicate<'_, T>) -> Result<usize>;
}
