//! 核心编排层：错误类型、任务状态、计划追踪、前置条件、恢复分类、执行队列与主循环

pub mod error;
pub mod plan;
pub mod precondition;
pub mod queue;
pub mod recovery;
pub mod state;
pub mod task_loop;

pub use error::AgentError;
pub use plan::{PlanState, StepStatus, STEP_MATCH_THRESHOLD};
pub use precondition::{Precondition, PreconditionChecker};
pub use queue::ExecutionQueue;
pub use recovery::{Classified, ErrorType, RecoveryEngine};
pub use state::{Artifacts, ErrorLog, TaskContext, TaskState};
pub use task_loop::TaskLoop;
