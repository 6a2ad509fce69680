pub mod delivery;
pub mod guard;
pub mod session;
pub mod verifier;

#[cfg(test)]
mod test_support;

pub use agentguard_core::{
    Action, ConversationTurn, GuardConfig, GuardError, GuardResult, StepKind, Trace,
};
pub use delivery::{DeliveryQueue, DeliverySettings, DeliveryStats};
pub use guard::{AgentGuard, RunError, Session, TraceScope};
pub use session::{SessionManager, SessionState};
pub use verifier::{VerificationClient, VerifierSettings};
