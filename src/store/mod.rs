pub mod blocklist;
pub mod error;
pub mod filestore;
pub mod memory;
pub mod traits;

pub use blocklist::BlocklistStore;
pub use error::StoreError;
pub use filestore::FileStore;
pub use memory::MemoryStore;
pub use traits::KeyValueBackend;
