//! Predication queries and the stores that answer them

pub mod builder;
pub mod memory;
pub mod postgres;
pub mod store;

pub use builder::{BuiltQuery, PARAM_COUNT, PredicationQuery, QueryBuilder, QueryParam, QueryScope};
pub use memory::{InMemoryPredicationStore, PredicationRecord};
pub use postgres::PgPredicationStore;
pub use store::{PredicationRow, PredicationStore, StoreError};
