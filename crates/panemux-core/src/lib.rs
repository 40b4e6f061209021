//! panemux-core: session orchestration engine.
//! Tracks interactive sessions, arranges them into single or split panes,
//! detaches them into floating windows, debounces busy/idle signals, and
//! selects which agent backend new launches use under rate limits.
//!
//! Pure state machines: no IO, no async. Callers pass the current time.

pub mod backend;
pub mod busy;
mod clock;
pub mod detach;
pub mod detection;
pub mod error;
pub mod fallback;
pub mod layout;
pub mod rate_limit;
pub mod registry;
pub mod session;
pub mod types;
pub mod window;
pub mod workspace;

pub use backend::{BackendEvent, BackendEventKind};
pub use busy::{BusyDebouncer, BusyToIdle};
pub use detach::{DetachmentBroker, DetachmentRecord};
pub use detection::{AgentDetectionResult, DetectionCache};
pub use error::CoreError;
pub use fallback::{FallbackChainConfig, FallbackController, FallbackEvent, FallbackStatus};
pub use layout::{LayoutController, TabLayout};
pub use rate_limit::{RateLimitInfo, RateLimitTracker};
pub use registry::{RegistryEvent, SessionRegistry, UpdateOutcome};
pub use session::{Session, SessionPatch, SessionSpec};
pub use types::{
    AgentType, AwaitingInput, ConnectionId, SessionId, ShellState, SplitDirection, TabId,
    UsageLimitKind, WindowHandle,
};
pub use window::{FloatingWindowSpec, WindowMessage};
pub use workspace::{Workspace, WorkspaceConfig, WorkspaceEvent, WorkspaceStatus};
