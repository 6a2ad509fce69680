pub mod config;
pub mod error;
pub mod models;
pub mod recorder;
pub mod threshold;
pub mod transport;
pub mod window;

pub use crate::config::{
    CorrectionMode, GuardConfig, Mode, ThresholdConfig, Transparency, VerifyFailurePolicy,
};
pub use error::GuardError;
pub use models::{Action, ConversationTurn, GuardResult, StepKind, Trace, TraceEvent};
pub use recorder::TraceRecorder;
pub use threshold::decide;
pub use transport::{
    CorrectionRequest, CorrectionResponse, GuardBackend, HttpTransport, TransportError,
    VerifyRequest, VerifyResponse,
};
pub use window::ConversationWindow;
