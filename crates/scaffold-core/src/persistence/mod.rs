pub mod example;
pub mod keyed_store;

pub use example::{Example, FieldMatch};
pub use keyed_store::{KeyedStore, StoreConfig};

use crate::models::{CoreError, Record};

pub type PersistenceResult<T> = Result<T, CoreError>;

/// Table-partitioned record CRUD shared by every session store.
///
/// Reads against a table that was never written behave as an empty table.
pub trait RecordStore: Send + Sync {
    fn generate_id(&self) -> String;

    /// Upserts `record`. An empty id is replaced by a fresh one and stamps
    /// `created_date`; an existing record keeps its original `created_date`.
    fn create_or_update(&self, table: &str, record: Record) -> PersistenceResult<Record>;

    fn find_by_id(&self, table: &str, id: &str) -> PersistenceResult<Option<Record>>;

    /// Reads, changes and writes back one record as a single step. Returns
    /// `None` without calling `change` when the record is missing; an error
    /// from `change` leaves the stored record untouched. The id and
    /// `created_date` survive whatever `change` does.
    fn update_by_id(
        &self,
        table: &str,
        id: &str,
        change: &mut dyn FnMut(&mut Record) -> PersistenceResult<()>,
    ) -> PersistenceResult<Option<Record>>;

    fn delete_by_id(&self, table: &str, id: &str) -> PersistenceResult<Option<Record>>;

    fn delete_by_table(&self, table: &str) -> PersistenceResult<usize>;

    fn get_all(&self, table: &str) -> PersistenceResult<Vec<Record>>;

    fn delete_all(&self) -> PersistenceResult<()>;

    fn find_first_by_example(
        &self,
        table: &str,
        example: &Example,
    ) -> PersistenceResult<Option<Record>>;

    fn find_all_by_example(&self, table: &str, example: &Example)
    -> PersistenceResult<Vec<Record>>;
}
