//! Fleet records (trips, reservations, drivers): pool and store implementations.

mod pool;
mod store;

pub use pool::{create_pool, DbPool};
pub use store::{DriverRecord, FleetStore, MemoryFleetStore, PgFleetStore};
