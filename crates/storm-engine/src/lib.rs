pub mod dispatch;
pub mod error;
pub mod groups;
pub mod jobs;
pub mod liveness;
pub mod render;

pub use dispatch::{dispatch_event, run_dispatcher};
pub use error::EngineError;
pub use groups::group_members;
pub use jobs::{exec_procedure, finish_job, handle_job, ExecRequest, JobOutcome};
pub use liveness::{run_sweeper, sweep_expired_agents, SweepState, HEARTBEAT_TIMEOUT};
pub use render::{PlainRenderer, RenderError, TemplateRenderer};
