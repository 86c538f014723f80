//! The two state machines: the session lifecycle and the orthogonal
//! agreement sub-state.

pub mod agreement;
pub mod session;

pub use agreement::AgreementDecision;
pub use session::{SessionDecision, SessionGuards, SessionTrigger};
