mod aggregate;
mod query;
mod row;
mod store;
mod types;

pub use aggregate::Aggregator;
pub use query::{Filter, Query, Summary};
pub use row::DgutaRow;
pub use store::{
    CHILDREN_DB_FILE, DEFAULT_BATCH_SIZE, GUTA_DB_FILE, SENTINEL_FILE, StoreWriter, merge_db_dirs,
    write_sentinel,
};
pub use types::{AgeBucket, FileTypeClass, GutaKey, GutaValue};
