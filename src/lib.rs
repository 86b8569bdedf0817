//! Filament - a workflow worker that claims DAG-shaped runs from an
//! orchestrator, executes step bodies in sandboxed child processes, and
//! streams lifecycle events back over a persistent channel.

pub mod channel;
pub mod compiler;
pub mod config;
pub mod executor;
pub mod install;
pub mod plan;
pub mod protocol;
pub mod publisher;
pub mod queue;
pub mod resolver;
pub mod sandbox;
pub mod scrub;
pub mod state;
pub mod transport;
pub mod worker;

pub use channel::Channel;
pub use compiler::{CompiledBody, Compiler, OpCompiler};
pub use config::Config;
pub use executor::{ExecEvent, Executor, RunReport};
pub use install::{AdaptorSpecifier, InstallStatus, Repo};
pub use plan::{ExecutionPlan, Step};
pub use protocol::{Envelope, Reason};
pub use sandbox::{InlinePool, Outcome, PoolConfig, ProcessPool, SandboxPool, StepTask};
pub use state::{ErrorInfo, RunState};
pub use worker::Worker;
