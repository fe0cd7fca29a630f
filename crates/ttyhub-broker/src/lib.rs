//! ttyhub-broker: multi-viewer PTY session broker
//!
//! Owns long-lived terminal processes, mirrors their output into an
//! off-screen terminal, and fans it out to any number of WebSocket viewers
//! with exactly-once, in-order delivery across attach, detach and reconnect.

pub mod activity;
pub mod api;
pub mod config;
pub mod error;
pub mod mode;
pub mod models;
pub mod observer;
pub mod pty;
pub mod registry;
pub mod session;
pub mod token;

pub use api::{build_router, OWNER_HEADER};
pub use config::{BrokerConfig, ServerArgs, DEFAULT_PORT};
pub use error::{BrokerError, BrokerResult};
pub use mode::{DefaultModes, ModeResolver, SpawnSpec};
pub use observer::{CloseReason, NoopObserver, SessionObserver, TracingObserver};
pub use pty::{NativePtySpawner, PtyControl, PtyEvent, PtySpawner, SpawnedPty};
pub use registry::SessionRegistry;
pub use session::{Connection, Outbound, Session};
