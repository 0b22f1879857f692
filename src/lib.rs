#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod cache;
pub mod config;
pub mod core;
pub mod error;
pub mod stats;
pub mod storage;
pub mod store;
pub mod trie;

pub use error::{Result, StoreError, TrieError};
pub use store::{DropCtrl, Match, PagedStore, ResetScope};
