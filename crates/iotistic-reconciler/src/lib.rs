pub mod error;
pub mod executor;
pub mod plan;
pub mod worker;

pub use error::ReconcileError;
pub use executor::{ExecutionReport, Executor, ExecutorConfig};
pub use plan::{plan, Plan, Step};
pub use worker::{refresh_current, ReconcileHandle, ReconcileTrigger, ReconcileWorker};
