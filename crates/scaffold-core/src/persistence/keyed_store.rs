use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::models::{CoreError, CoreErrorKind, Record, now_millis};
use crate::models::error::poisoned;
use crate::persistence::{Example, PersistenceResult, RecordStore};

type Table = BTreeMap<String, Record>;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StoreConfig {
    pub path: Option<PathBuf>,
    pub load_on_startup: bool,
}

/// In-memory store of records grouped into named tables.
///
/// Tables appear on first write. Every method holds the table lock for its
/// whole duration, so callers never observe a partial mutation.
#[derive(Debug, Default)]
pub struct KeyedStore {
    config: StoreConfig,
    tables: Mutex<BTreeMap<String, Table>>,
}

impl KeyedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: StoreConfig) -> Self {
        Self {
            config,
            tables: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn path(&self) -> Option<&Path> {
        self.config.path.as_deref()
    }

    /// Loads the backing file when `load_on_startup` is set. Returns whether a load ran.
    pub async fn init(&self) -> PersistenceResult<bool> {
        if !self.config.load_on_startup {
            return Ok(false);
        }
        self.load_db().await?;
        Ok(true)
    }

    pub fn table_names(&self) -> PersistenceResult<Vec<String>> {
        Ok(self.lock_tables()?.keys().cloned().collect())
    }

    /// Writes every table to the backing file as `[[table, [records...]], ...]`.
    pub async fn save_db(&self) -> PersistenceResult<()> {
        let path = self.config.path.clone().ok_or_else(|| {
            storage_error("save_db", "no persistence path is configured".to_string())
        })?;

        let encoded = {
            let tables = self.lock_tables()?;
            let snapshot: Vec<(&String, Vec<&Record>)> = tables
                .iter()
                .map(|(name, table)| (name, table.values().collect()))
                .collect();
            serde_json::to_string_pretty(&snapshot).map_err(|error| {
                storage_error("save_db", format!("failed to encode tables: {error}"))
            })?
        };

        tokio::fs::write(&path, encoded).await.map_err(|error| {
            storage_error(
                "save_db",
                format!("failed to write '{}': {error}", path.display()),
            )
        })?;

        tracing::debug!(path = %path.display(), "saved keyed store");
        Ok(())
    }

    /// Replaces every table with the backing file's content.
    ///
    /// A missing file (or no configured path) leaves the store empty. Records
    /// without an id are dropped.
    pub async fn load_db(&self) -> PersistenceResult<()> {
        let Some(path) = self.config.path.clone() else {
            self.lock_tables()?.clear();
            return Ok(());
        };

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                self.lock_tables()?.clear();
                tracing::debug!(path = %path.display(), "no saved keyed store, starting empty");
                return Ok(());
            }
            Err(error) => {
                return Err(storage_error(
                    "load_db",
                    format!("failed to read '{}': {error}", path.display()),
                ));
            }
        };

        let decoded: Vec<(String, Vec<Record>)> =
            serde_json::from_str(&content).map_err(|error| {
                storage_error(
                    "load_db",
                    format!("failed to decode '{}': {error}", path.display()),
                )
            })?;

        let mut tables = self.lock_tables()?;
        tables.clear();
        for (name, records) in decoded {
            let table = records
                .into_iter()
                .filter(|record| !record.id.is_empty())
                .map(|record| (record.id.clone(), record))
                .collect();
            tables.insert(name, table);
        }

        tracing::debug!(path = %path.display(), tables = tables.len(), "loaded keyed store");
        Ok(())
    }

    fn lock_tables(&self) -> PersistenceResult<MutexGuard<'_, BTreeMap<String, Table>>> {
        self.tables.lock().map_err(|_| poisoned("keyed store"))
    }
}

impl RecordStore for KeyedStore {
    fn generate_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    fn create_or_update(&self, table: &str, mut record: Record) -> PersistenceResult<Record> {
        let mut tables = self.lock_tables()?;
        let rows = tables.entry(table.to_string()).or_default();

        if record.id.is_empty() {
            record.id = self.generate_id();
            record.created_date = Some(now_millis());
        } else if let Some(existing) = rows.get(&record.id) {
            record.created_date = existing.created_date.or(record.created_date);
        }
        if record.created_date.is_none() {
            record.created_date = Some(now_millis());
        }

        rows.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    fn find_by_id(&self, table: &str, id: &str) -> PersistenceResult<Option<Record>> {
        let tables = self.lock_tables()?;
        Ok(tables.get(table).and_then(|rows| rows.get(id)).cloned())
    }

    fn update_by_id(
        &self,
        table: &str,
        id: &str,
        change: &mut dyn FnMut(&mut Record) -> PersistenceResult<()>,
    ) -> PersistenceResult<Option<Record>> {
        let mut tables = self.lock_tables()?;
        let Some(stored) = tables.get_mut(table).and_then(|rows| rows.get_mut(id)) else {
            return Ok(None);
        };

        let mut changed = stored.clone();
        change(&mut changed)?;
        changed.id = stored.id.clone();
        changed.created_date = stored.created_date.or(changed.created_date);
        *stored = changed.clone();
        Ok(Some(changed))
    }

    fn delete_by_id(&self, table: &str, id: &str) -> PersistenceResult<Option<Record>> {
        let mut tables = self.lock_tables()?;
        Ok(tables.get_mut(table).and_then(|rows| rows.remove(id)))
    }

    fn delete_by_table(&self, table: &str) -> PersistenceResult<usize> {
        let mut tables = self.lock_tables()?;
        Ok(tables.remove(table).map(|rows| rows.len()).unwrap_or(0))
    }

    fn get_all(&self, table: &str) -> PersistenceResult<Vec<Record>> {
        let tables = self.lock_tables()?;
        Ok(tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    fn delete_all(&self) -> PersistenceResult<()> {
        self.lock_tables()?.clear();
        Ok(())
    }

    fn find_first_by_example(
        &self,
        table: &str,
        example: &Example,
    ) -> PersistenceResult<Option<Record>> {
        let tables = self.lock_tables()?;
        Ok(tables
            .get(table)
            .and_then(|rows| rows.values().find(|record| example.matches(record)))
            .cloned())
    }

    fn find_all_by_example(&self, table: &str, example: &Example) -> PersistenceResult<Vec<Record>> {
        let tables = self.lock_tables()?;
        Ok(tables
            .get(table)
            .map(|rows| {
                rows.values()
                    .filter(|record| example.matches(record))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

fn storage_error(operation_name: &str, message: String) -> CoreError {
    CoreError::new(
        CoreErrorKind::StorageFailure,
        format!("{operation_name} failed: {message}"),
    )
}
