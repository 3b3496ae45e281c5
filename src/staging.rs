use rusqlite::Connection;
use tracing::{debug, warn};

/// A temp table bound to the transaction it was created in.
///
/// Call [`StagingArena::discard`] before committing. On early return the
/// `Drop` impl removes the table while the transaction is still open, so the
/// rollback that follows leaves nothing behind either way.
pub struct StagingArena<'c> {
    conn: &'c Connection,
    table: &'static str,
    open: bool,
}

impl<'c> StagingArena<'c> {
    pub fn create(
        conn: &'c Connection,
        table: &'static str,
        columns: &str,
    ) -> rusqlite::Result<Self> {
        // A leftover from a crashed run on this connection would shadow the new one.
        conn.execute_batch(&format!(
            "DROP TABLE IF EXISTS temp.{table};
             CREATE TEMP TABLE {table} ({columns});"
        ))?;
        debug!(table, "staging arena created");
        Ok(Self {
            conn,
            table,
            open: true,
        })
    }

    pub fn index_on(&self, column: &str) -> rusqlite::Result<()> {
        self.conn.execute_batch(&format!(
            "CREATE INDEX temp.idx_{table}_{column} ON {table}({column});",
            table = self.table,
        ))
    }

    pub fn len(&self) -> rusqlite::Result<usize> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM temp.{}", self.table),
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> rusqlite::Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn discard(mut self) -> rusqlite::Result<()> {
        self.open = false;
        self.drop_table()
    }

    fn drop_table(&self) -> rusqlite::Result<()> {
        self.conn
            .execute_batch(&format!("DROP TABLE IF EXISTS temp.{};", self.table))
    }
}

impl Drop for StagingArena<'_> {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = self.drop_table() {
                warn!(table = self.table, error = %e, "failed to drop staging arena");
            }
        }
    }
}
