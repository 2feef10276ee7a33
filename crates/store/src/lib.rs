pub mod checksum;
pub mod error;
pub mod file_store;
pub mod layout;

pub use checksum::{checksum_bytes, checksum_of, checksum_value};
pub use error::StoreError;
pub use file_store::FileStore;
pub use layout::ConversationLayout;
