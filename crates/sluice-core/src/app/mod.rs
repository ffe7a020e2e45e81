//! App - アプリケーション層
//!
//! ports を組み合わせて dispatch runtime を実装する。
//!
//! # 主要コンポーネント
//! - **Dispatcher**: backend を並列に消費して processor に振り分ける
//! - **BufferedDispatcher**: ローカル buffer + flush workers を前段に置く
//! - **DispatcherBuilder**: 構築とワイヤリング（fail-fast 検証）
//! - **ProcessorRegistry**: source_type → processor
//! - **HandlerList / Accumulator**: 結果の配送先
//! - **CancelToken**: 協調的キャンセル

pub mod buffered;
pub mod builder;
pub mod cancel;
pub mod dispatcher;
pub mod handlers;
pub mod registry;

pub use self::buffered::BufferedDispatcher;
pub use self::builder::{BuildError, DispatcherBuilder};
pub use self::cancel::CancelToken;
pub use self::dispatcher::{DispatchStats, Dispatcher, Disposition};
pub use self::handlers::{Accumulator, Handler, HandlerList};
pub use self::registry::ProcessorRegistry;
