pub mod catalog;
pub mod db_pool;
pub mod schema;
