pub mod accessors;
pub mod mutators;
mod registry;
mod transaction;

pub use registry::{Mutation, Query};
pub use transaction::{
    get_as, scan_as, Clock, ManualClock, ReadTransaction, ReadTx, ScanOptions, ScanStart,
    SystemClock, WriteTransaction, ANNOTATIONS_PER_ARTICLE, ARTICLES_BY_TOPIC,
};
