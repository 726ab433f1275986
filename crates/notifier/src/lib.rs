pub mod claimer;
pub mod dispatcher;
pub mod gateway;
pub mod idgen;
pub mod pipeline;
pub mod reconciler;
pub mod requeue;
pub mod run_lock;
pub mod scheduler;
pub mod store;
