use duckdb::Connection;
use r2d2::ManageConnection;
use std::sync::Mutex;

/// Hands out connections cloned from one DuckDB database instance, so every pooled
/// connection sees the same catalog (including `:memory:` databases).
pub struct DuckDBConnectionManager {
    root: Mutex<Connection>,
}

impl DuckDBConnectionManager {
    pub fn new(connection_string: &str) -> Result<Self, duckdb::Error> {
        let root = if connection_string.is_empty() || connection_string == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(connection_string)?
        };

        Ok(Self {
            root: Mutex::new(root),
        })
    }
}

impl ManageConnection for DuckDBConnectionManager {
    type Connection = Connection;
    type Error = duckdb::Error;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let root = self.root.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        root.try_clone()
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.execute("SELECT 1", [])?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

pub type DbPool = r2d2::Pool<DuckDBConnectionManager>;

pub fn build_pool(connection_string: &str, pool_size: usize) -> Result<DbPool, Box<dyn std::error::Error + Send + Sync>> {
    let manager = DuckDBConnectionManager::new(connection_string)?;
    let pool = r2d2::Pool::builder()
        .max_size(pool_size.max(1) as u32)
        .build(manager)?;
    Ok(pool)
}
