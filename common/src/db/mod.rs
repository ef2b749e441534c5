// Database layer: pool engine, lifecycle manager, PostgreSQL wiring and repositories

pub mod manager;
pub mod pool;
pub mod postgres;
pub mod repositories;

pub use manager::{Initialization, PoolManager};
pub use pool::{ConnectionFactory, ConnectionPool, PoolOptions, PoolStatus, PooledConnection};
pub use postgres::{run_migrations, PgConnectionFactory, PgPoolManager};
