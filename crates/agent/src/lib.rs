//! The reasoning loop and the session that wraps it.
//!
//! The loop follows a **Think → Act → Observe** cycle:
//!
//! 1. **Init**: seed the history with the system instruction and the query
//! 2. **Think**: ask the reasoning provider for the next action
//! 3. **Act**: dispatch each proposed tool call, append the observations
//! 4. Loop back to step 2 until the provider answers in text
//!
//! The loop stops on a final answer, an exhausted iteration or time budget,
//! a provider failure, or shutdown. A [`session`] spawns the peers, runs the
//! loop and always tears everything down exactly once.

pub mod loop_runner;
pub mod session;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use loop_runner::{AgentLoop, LoopError, LoopOutcome, LoopPhase, LoopState};
pub use session::{run_session, SessionParams, SessionReport, SessionStatus, CANCELLED_MESSAGE};
