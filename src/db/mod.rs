mod repository;
mod schema;

pub use repository::{KvStore, KvWrite};
