//! Impls - SourceQueue の実装
//!
//! # 含まれる実装
//! - **DistributedQueue**: 本番用。distribution ごとに shard、bounded、timeout 付き
//! - **MemoryQueue**: 参照実装。blocking なし
//!
//! Remote backends live outside this crate and implement the same port.

pub mod distributed;
pub mod memory;

pub use self::distributed::DistributedQueue;
pub use self::memory::MemoryQueue;
