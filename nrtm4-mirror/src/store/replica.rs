use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use redb::{
    Database, ReadTransaction, ReadableTable, Table, TableDefinition, WriteTransaction,
    backends::InMemoryBackend,
};
use snafu::{ResultExt, ensure};
use tracing::{debug, info};
use url::Url;

use super::{
    ClosedSnafu, CreateDirSnafu, DatabaseSnafu, DuplicateSourceSnafu, EncodeNotificationSnafu,
    InvalidStoredUrlSnafu, Repository, StoreError, UnknownSourceSnafu,
};
use crate::{
    clock::{Clock, SystemClock, from_millis, to_millis},
    model::{NotificationRecord, ObjectRow, Source, SourceId},
    protocol::{Notification, NrtmFileHeader},
    rpsl::RpslObject,
};

/// (name, session id, version, notification url, label, created ms)
type SourceValue = (
    &'static str,
    &'static str,
    u64,
    &'static str,
    &'static str,
    u64,
);
/// (object type, primary key, from version, to version, payload)
type ObjectValue = (&'static str, &'static str, u64, u64, &'static str);

const SOURCES_TABLE: TableDefinition<u64, SourceValue> = TableDefinition::new("sources-1");
/// Keyed by (source id, row id).
const OBJECTS_TABLE: TableDefinition<(u64, u64), ObjectValue> = TableDefinition::new("objects-1");
/// (source id, object type, primary key) to the row id of the current row.
const CURRENT_TABLE: TableDefinition<(u64, &str, &str), u64> =
    TableDefinition::new("current-objects-1");
/// (source id, version) to (created ms, notification json).
const NOTIFICATIONS_TABLE: TableDefinition<(u64, u64), (u64, &str)> =
    TableDefinition::new("notifications-1");
const COUNTERS_TABLE: TableDefinition<&str, u64> = TableDefinition::new("counters-1");

const SOURCE_ID_COUNTER: &str = "source-id";
const ROW_ID_COUNTER: &str = "object-row-id";

trait DbResultExt<T> {
    fn db(self) -> Result<T, StoreError>;
}

impl<T, E: Into<redb::Error>> DbResultExt<T> for Result<T, E> {
    fn db(self) -> Result<T, StoreError> {
        self.map_err(Into::<redb::Error>::into)
            .context(DatabaseSnafu)
    }
}

/// [`Repository`] backed by a redb database.
#[derive(Debug)]
pub struct ReplicaStore {
    db: Database,
    clock: Arc<dyn Clock>,
    closed: AtomicBool,
}

impl ReplicaStore {
    pub fn persistent(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        info!("loading replica database from {}", path.display());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu)?;
        }
        let db = Database::builder().create(path).db()?;
        Self::open(db)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        info!("using in-memory replica database");
        let db = Database::builder()
            .create_with_backend(InMemoryBackend::new())
            .db()?;
        Self::open(db)
    }

    pub fn open(db: Database) -> Result<Self, StoreError> {
        let tx = db.begin_write().db()?;
        {
            tx.open_table(SOURCES_TABLE).db()?;
            tx.open_table(OBJECTS_TABLE).db()?;
            tx.open_table(CURRENT_TABLE).db()?;
            tx.open_table(NOTIFICATIONS_TABLE).db()?;
            tx.open_table(COUNTERS_TABLE).db()?;
        }
        tx.commit().db()?;
        Ok(Self {
            db,
            clock: Arc::new(SystemClock),
            closed: AtomicBool::new(false),
        })
    }

    /// Uses `clock` to timestamp recorded notifications.
    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        Self { clock, ..self }
    }

    fn begin_write(&self) -> Result<WriteTransaction, StoreError> {
        ensure!(!self.closed.load(Ordering::Acquire), ClosedSnafu);
        self.db.begin_write().db()
    }

    fn begin_read(&self) -> Result<ReadTransaction, StoreError> {
        ensure!(!self.closed.load(Ordering::Acquire), ClosedSnafu);
        self.db.begin_read().db()
    }

    fn write_source(
        &self,
        tx: &WriteTransaction,
        source: &Source,
        notification: Option<&Notification>,
    ) -> Result<Source, StoreError> {
        let json = notification
            .map(serde_json::to_string)
            .transpose()
            .context(EncodeNotificationSnafu)?;
        let id = if source.id.0 == 0 {
            SourceId(next_counter(tx, SOURCE_ID_COUNTER).db()?)
        } else {
            source.id
        };

        let mut sources = tx.open_table(SOURCES_TABLE).db()?;
        for entry in sources.iter().db()? {
            let (key, value) = entry.db()?;
            let (name, _, _, _, label, _) = value.value();
            ensure!(
                key.value() == id.0 || name != source.name || label != source.label,
                DuplicateSourceSnafu {
                    name: &source.name,
                    label: &source.label,
                }
            );
        }
        sources
            .insert(
                id.0,
                (
                    source.name.as_str(),
                    source.session_id.as_str(),
                    source.version,
                    source.notification_url.as_str(),
                    source.label.as_str(),
                    to_millis(source.created),
                ),
            )
            .db()?;

        if let Some(json) = json {
            let mut history = tx.open_table(NOTIFICATIONS_TABLE).db()?;
            history
                .insert(
                    (id.0, source.version),
                    (to_millis(self.clock.now()), json.as_str()),
                )
                .db()?;
        }
        Ok(Source {
            id,
            ..source.clone()
        })
    }
}

impl Repository for ReplicaStore {
    fn next_source_id(&self) -> Result<SourceId, StoreError> {
        let tx = self.begin_write()?;
        let id = next_counter(&tx, SOURCE_ID_COUNTER).db()?;
        tx.commit().db()?;
        Ok(SourceId(id))
    }

    fn get_sources(&self) -> Result<Vec<Source>, StoreError> {
        let tx = self.begin_read()?;
        let table = tx.open_table(SOURCES_TABLE).db()?;
        let mut sources = Vec::new();
        for entry in table.iter().db()? {
            let (key, value) = entry.db()?;
            let id = SourceId(key.value());
            let (name, session_id, version, url, label, created) = value.value();
            let notification_url = Url::parse(url).context(InvalidStoredUrlSnafu { id })?;
            sources.push(Source {
                id,
                name: name.to_string(),
                session_id: session_id.to_string(),
                version,
                notification_url,
                label: label.to_string(),
                created: from_millis(created),
            });
        }
        Ok(sources)
    }

    fn save_source(
        &self,
        source: &Source,
        notification: Option<&Notification>,
    ) -> Result<Source, StoreError> {
        let tx = self.begin_write()?;
        let saved = self.write_source(&tx, source, notification)?;
        tx.commit().db()?;
        debug!(id = %saved.id, version = saved.version, "saved source");
        Ok(saved)
    }

    fn replace_source(
        &self,
        previous: SourceId,
        source: &Source,
        notification: Option<&Notification>,
    ) -> Result<Source, StoreError> {
        let tx = self.begin_write()?;
        remove_all(&tx, previous.0).db()?;
        let saved = self.write_source(&tx, source, notification)?;
        tx.commit().db()?;
        info!(%previous, id = %saved.id, "replaced source");
        Ok(saved)
    }

    fn remove_source(&self, id: SourceId) -> Result<bool, StoreError> {
        let tx = self.begin_write()?;
        let removed = remove_all(&tx, id.0).db()?;
        tx.commit().db()?;
        Ok(removed)
    }

    fn save_snapshot_objects(
        &self,
        source: &Source,
        objects: &[RpslObject],
        header: &NrtmFileHeader,
    ) -> Result<(), StoreError> {
        let tx = self.begin_write()?;
        write_objects(&tx, source.id.0, objects, header.version).db()?;
        tx.commit().db()?;
        Ok(())
    }

    fn add_modify_object(
        &self,
        source: &Source,
        object: &RpslObject,
        header: &NrtmFileHeader,
    ) -> Result<(), StoreError> {
        let tx = self.begin_write()?;
        write_objects(&tx, source.id.0, std::slice::from_ref(object), header.version).db()?;
        tx.commit().db()?;
        Ok(())
    }

    fn delete_object(
        &self,
        source: &Source,
        object_type: &str,
        primary_key: &str,
        header: &NrtmFileHeader,
    ) -> Result<bool, StoreError> {
        let object_type = object_type.to_ascii_lowercase();
        let primary_key = primary_key.to_ascii_uppercase();
        let tx = self.begin_write()?;
        let deleted = {
            let mut rows = tx.open_table(OBJECTS_TABLE).db()?;
            let mut current = tx.open_table(CURRENT_TABLE).db()?;
            let row_id = current
                .remove((source.id.0, object_type.as_str(), primary_key.as_str()))
                .db()?
                .map(|guard| guard.value());
            match row_id {
                Some(row_id) => {
                    close_row(&mut rows, (source.id.0, row_id), header.version).db()?;
                    true
                }
                None => false,
            }
        };
        tx.commit().db()?;
        Ok(deleted)
    }

    fn get_notification_history(
        &self,
        id: SourceId,
        from: u64,
        to: u64,
    ) -> Result<Vec<NotificationRecord>, StoreError> {
        let tx = self.begin_read()?;
        let table = tx.open_table(NOTIFICATIONS_TABLE).db()?;
        let mut records = Vec::new();
        for entry in table.range((id.0, from)..=(id.0, to)).db()? {
            let (key, value) = entry.db()?;
            let (_, version) = key.value();
            let (created, payload) = value.value();
            records.push(NotificationRecord {
                source_id: id,
                version,
                created: from_millis(created),
                payload: payload.to_string(),
            });
        }
        Ok(records)
    }

    fn get_current_objects(&self, id: SourceId) -> Result<Vec<ObjectRow>, StoreError> {
        let mut rows = self.source_rows(id)?;
        rows.retain(ObjectRow::is_current);
        Ok(rows)
    }

    fn get_object_history(
        &self,
        id: SourceId,
        object_type: &str,
        primary_key: &str,
    ) -> Result<Vec<ObjectRow>, StoreError> {
        let object_type = object_type.to_ascii_lowercase();
        let primary_key = primary_key.to_ascii_uppercase();
        let mut rows = self.source_rows(id)?;
        rows.retain(|row| row.object_type == object_type && row.primary_key == primary_key);
        Ok(rows)
    }

    fn close(&self) -> Result<(), StoreError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("replica store closed");
        }
        Ok(())
    }
}

impl ReplicaStore {
    fn source_rows(&self, id: SourceId) -> Result<Vec<ObjectRow>, StoreError> {
        let tx = self.begin_read()?;
        let table = tx.open_table(OBJECTS_TABLE).db()?;
        let mut rows = Vec::new();
        for entry in table.range((id.0, 0)..=(id.0, u64::MAX)).db()? {
            let (_, value) = entry.db()?;
            let (object_type, primary_key, from_version, to_version, payload) = value.value();
            rows.push(ObjectRow {
                object_type: object_type.to_string(),
                primary_key: primary_key.to_string(),
                payload: payload.to_string(),
                from_version,
                to_version,
            });
        }
        Ok(rows)
    }

    /// Fails with [`StoreError::UnknownSource`] if `id` has no source row.
    pub fn get_source(&self, id: SourceId) -> Result<Source, StoreError> {
        self.get_sources()?
            .into_iter()
            .find(|s| s.id == id)
            .ok_or_else(|| UnknownSourceSnafu { id }.build())
    }
}

fn next_counter(tx: &WriteTransaction, name: &str) -> Result<u64, redb::Error> {
    let mut counters = tx.open_table(COUNTERS_TABLE)?;
    let next = counters.get(name)?.map(|v| v.value()).unwrap_or(0) + 1;
    counters.insert(name, next)?;
    Ok(next)
}

/// Sets `to_version` on a row.
fn close_row(
    rows: &mut Table<'_, (u64, u64), ObjectValue>,
    key: (u64, u64),
    to_version: u64,
) -> Result<(), redb::Error> {
    let row = rows.get(key)?.map(|guard| {
        let (object_type, primary_key, from, _, payload) = guard.value();
        (
            object_type.to_string(),
            primary_key.to_string(),
            from,
            payload.to_string(),
        )
    });
    if let Some((object_type, primary_key, from, payload)) = row {
        rows.insert(
            key,
            (
                object_type.as_str(),
                primary_key.as_str(),
                from,
                to_version,
                payload.as_str(),
            ),
        )?;
    }
    Ok(())
}

/// Closes the current row of every object's key and adds a new current row.
fn write_objects(
    tx: &WriteTransaction,
    source_id: u64,
    objects: &[RpslObject],
    version: u64,
) -> Result<(), redb::Error> {
    let mut rows = tx.open_table(OBJECTS_TABLE)?;
    let mut current = tx.open_table(CURRENT_TABLE)?;
    let mut counters = tx.open_table(COUNTERS_TABLE)?;
    let mut row_id = counters
        .get(ROW_ID_COUNTER)?
        .map(|v| v.value())
        .unwrap_or(0);
    for object in objects {
        let key = (
            source_id,
            object.object_type.as_str(),
            object.primary_key.as_str(),
        );
        let previous = current.get(key)?.map(|v| v.value());
        if let Some(previous) = previous {
            close_row(&mut rows, (source_id, previous), version)?;
        }
        row_id += 1;
        rows.insert(
            (source_id, row_id),
            (
                object.object_type.as_str(),
                object.primary_key.as_str(),
                version,
                0,
                object.payload.as_str(),
            ),
        )?;
        current.insert(key, row_id)?;
    }
    counters.insert(ROW_ID_COUNTER, row_id)?;
    Ok(())
}

/// Removes the source row, objects and history of `id`.
fn remove_all(tx: &WriteTransaction, id: u64) -> Result<bool, redb::Error> {
    let mut removed = {
        let mut sources = tx.open_table(SOURCES_TABLE)?;
        #[allow(clippy::let_and_return)]
        let existed = sources.remove(id)?.is_some();
        existed
    };

    let mut rows = tx.open_table(OBJECTS_TABLE)?;
    let keys = rows
        .range((id, 0)..=(id, u64::MAX))?
        .map(|entry| entry.map(|(key, _)| key.value()))
        .collect::<Result<Vec<_>, _>>()?;
    removed |= !keys.is_empty();
    for key in keys {
        rows.remove(key)?;
    }

    let mut current = tx.open_table(CURRENT_TABLE)?;
    let keys = current
        .range((id, "", "")..(id + 1, "", ""))?
        .map(|entry| {
            entry.map(|(key, _)| {
                let (_, object_type, primary_key) = key.value();
                (object_type.to_string(), primary_key.to_string())
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    for (object_type, primary_key) in keys {
        current.remove((id, object_type.as_str(), primary_key.as_str()))?;
    }

    let mut history = tx.open_table(NOTIFICATIONS_TABLE)?;
    let keys = history
        .range((id, 0)..=(id, u64::MAX))?
        .map(|entry| entry.map(|(key, _)| key.value()))
        .collect::<Result<Vec<_>, _>>()?;
    for key in keys {
        history.remove(key)?;
    }
    Ok(removed)
}
