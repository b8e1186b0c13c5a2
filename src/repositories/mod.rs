//! External message plumbing: Redis pub/sub backplane for multi-node fan-out.

pub mod redis_repo;

pub use redis_repo::{Backplane, BackplaneMessage, RedisRepository};
