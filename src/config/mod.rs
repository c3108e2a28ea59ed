//! 配置存储模块
//!
//! 提供路径寻址的层级配置存储、变更订阅以及本地文件与远程两种后端

pub mod bootstrap;
pub mod dispatch;
pub mod event;
pub mod firebase;
pub mod local;
pub mod path;
pub mod remote;
pub mod store;
pub mod transport;
pub mod tree;

// 重新导出主要类型
pub use bootstrap::{default_config_dir, open_store, BootstrapConfig};
pub use event::{listener, ChangeEvent, ChangeListener, EventKind, SubscriptionId};
pub use firebase::FirebaseTransport;
pub use local::{DocumentFormat, LocalFileStore};
pub use path::ConfigPath;
pub use remote::RemoteHierarchicalStore;
pub use store::ConfigStore;
pub use transport::{MemoryTransport, TreeChange, TreeTransport};
