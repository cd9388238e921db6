mod versioned_schema;

pub use versioned_schema::{
    configure_connection, open_versioned, Column, SqlType, Table, VersionedSchema,
    BASE_DB_VERSION, BUSY_TIMEOUT,
};

/// Returns true when `err` is a lock conflict that goes away on retry
/// (another writer held the database or a table).
pub fn is_transient_conflict(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(e, _))
                if matches!(
                    e.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                )
        )
    })
}
