pub mod db;
pub mod gp_store;

pub use db::Db;
pub use gp_store::{
    write_with_fallback, FacilityStore, MemoryStore, PgFacilityStore, StoreError, UpdateType,
};
