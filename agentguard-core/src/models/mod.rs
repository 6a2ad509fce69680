pub mod result;
pub mod session;
pub mod trace;

pub use result::{Action, GuardResult};
pub use session::ConversationTurn;
pub use trace::{StepKind, Trace, TraceEvent};
