// crates/memori/src/db/schema/mod.rs
// Per-backend schema setup. All setup paths are idempotent and safe against
// partial prior initialization.

pub mod mysql;
pub mod postgres;
pub mod sqlite;
