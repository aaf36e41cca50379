//! The Ferrule agent engine.
//!
//! A user request runs through the [`RequestLoop`]:
//!
//! 1. **Append** the user input to the session's conversation
//! 2. **Call the model** through a [`ModelClient`](ferrule_core::ModelClient)
//! 3. **Parse** the reply into tool calls ([`parser`])
//! 4. **If tool calls**: execute them in order, append the assistant text and
//!    one consolidated tool-results message, optionally optimize, loop to 2
//! 5. **If plain text**: that is the final answer
//!
//! Every request is registered with the [`CancellationRegistry`] so it can be
//! aborted by job id, and the [`ContextOptimizer`] keeps long sessions small.

pub mod cancel;
pub mod loop_runner;
pub mod optimizer;
pub mod parser;
pub mod prompt;
pub mod session;
pub mod transcript;

pub use cancel::{CancellationRegistry, JobGuard, JobHandle, JobInfo};
pub use loop_runner::{LoopConfig, RequestLoop, RunOptions, RunOutcome, RunReport, ToolUsage};
pub use optimizer::{ContextOptimizer, OptimizationReport, OptimizerState, OptimizerStats};
pub use parser::{ParseError, ParseOutcome, RejectedBlock};
pub use prompt::build_system_prompt;
pub use session::{
    ConversationStore, InMemoryStore, JsonFileStore, Session, SessionManager, SessionSnapshot,
};
pub use transcript::{ToolOutcome, tool_results_message};
