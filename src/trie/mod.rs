//! 稀疏通配决策树：枚举（flatten）与最小化（clip）。
//!
//! 两者都是无 I/O 的纯函数；结果的持久化由调用方经 `PagedStore` 完成。

pub mod clip;
pub mod flatten;
pub mod node;

pub use clip::{clip, clip_json};
pub use flatten::{flatten, FlatTuple};
pub use node::{Branch, TrieNode};
