pub mod budget;
pub mod cache_server;
pub mod engine;
pub mod merged;
pub mod pool;
pub mod state;

pub use budget::{MergedBudgetCreditor, NO_CREDITOR_INDEX};
pub use cache_server::{CacheServerFactory, TopicRegistry, WatcherKind};
pub use engine::{Engine, EngineContext, HandlerRef, StreamFactory, StreamHandler};
pub use merged::MergedStreamFactory;
pub use pool::DispatcherPool;
pub use state::StreamState;
