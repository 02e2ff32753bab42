//! Domain model for daibug: events, bounded stores, redaction, watch rules,
//! and diffable session recordings. Everything here is runtime-free; the
//! hub crate owns sockets, processes, and scheduling.

pub mod config;
pub mod detect;
pub mod diff;
pub mod error;
pub mod event;
pub mod glob;
pub mod redact;
pub mod ring;
pub mod session;
pub mod watch;

pub use config::Config;
pub use detect::FrameworkDetector;
pub use error::CoreError;
pub use event::{Event, EventFactory, Interaction, Level, Payload, Source, StorageSnapshot, TabInfo};
pub use redact::Redactor;
pub use ring::Ring;
pub use session::{Session, SessionRecorder, SessionSummary};
pub use watch::{WatchConditions, WatchEngine, WatchRule, WatchedEvent};
