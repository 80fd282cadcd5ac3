//! Interactive sessions: long-lived sandboxed processes with live output
//! streaming, stdin forwarding, resource accounting and a signed NDJSON
//! transcript.
//!
//! Lifecycle: `starting -> running -> {exited | stopped | error | timeout}`.
//! Terminal states are absorbing; wall time freezes at exit.

pub mod orchestrator;
pub mod registry;
pub mod ring;
pub mod signing;
pub mod state;
pub mod transcript;
pub mod types;

pub use orchestrator::{new_session_id, parse_signal, transcript_route, SessionOrchestrator};
pub use registry::{KeyClaim, SessionRegistry};
pub use ring::RingBuffer;
pub use signing::UrlSigner;
pub use state::{Session, Subscription};
pub use transcript::{sha256_hex, Direction, Lifecycle, Transcript};
pub use types::{
    InputAck, InputRequest, LimitKind, SessionArtifacts, SessionDetails, SessionEvent, SessionLimits,
    SessionStatus, SessionSummary, SessionUsage, StartSessionRequest, StartedSession, StopRequest,
    StreamRef,
};
