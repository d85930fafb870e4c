pub mod memstore;
pub mod persistence;
pub mod vault;

pub use memstore::{MemEngine, StoredRow};
pub use persistence::Persistence;
pub use vault::Sealer;
