//! # cortex-relay
//!
//! Resilient session management and sample broadcast relay for Emotiv
//! Cortex EEG headsets.
//!
//! The crate keeps a control connection to the Cortex service alive through
//! an unreliable device/link, negotiates access, authorization, headset
//! discovery, session create/reuse, and stream subscription, and fans every
//! accepted EEG sample out to any number of downstream WebSocket consumers
//! on a local port.
//!
//! ## Quick Start
//!
//! ```ignore
//! use cortex_relay::{CortexRelay, RelayConfig};
//!
//! #[tokio::main]
//! async fn main() -> cortex_relay::RelayResult<()> {
//!     // Load config from environment or relay.toml
//!     let config = RelayConfig::discover(None)?;
//!
//!     let mut relay = CortexRelay::new(config);
//!     let addr = relay.bind().await?;
//!     println!("broadcasting samples on ws://{addr}");
//!
//!     // Watch lifecycle events while the relay runs
//!     let mut events = relay.event_receiver();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("event: {event:?}");
//!         }
//!     });
//!
//!     relay.run().await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ reconnect driver (driver.rs)                               │
//! │   connect ──► session negotiator (session.rs)              │
//! │                 requestAccess → authorize → queryHeadsets  │
//! │                 → controlDevice → createSession/reuse      │
//! │                 → subscribe → streaming                    │
//! │                 subscribe guard + stream watchdog          │
//! │                      │ SamplePacket (mpsc hand-off)        │
//! │                      ▼                                     │
//! │ broadcast relay (relay.rs) ──► consumer 1..N (WebSocket)   │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Recovery is layered: distinguished vendor error codes each route to a
//! specific action (session reuse, headset re-discovery, or a hard reset),
//! a short post-subscribe guard retries silent subscriptions a bounded
//! number of times, and a continuous stream watchdog detects silent drops
//! and forces headset re-discovery. A hard reset tears the control
//! connection down, which is the signal for the reconnect driver to rebuild
//! everything from scratch.

pub mod config;
pub mod driver;
pub mod error;
pub mod events;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod signal;

// ─── Public re-exports ──────────────────────────────────────────────────

pub use config::RelayConfig;
pub use driver::CortexRelay;
pub use error::{RelayError, RelayResult};
pub use events::{EventBus, LifecycleEvent};
pub use protocol::frames::{ChannelSelection, SamplePacket};
pub use session::{Session, SessionNegotiator, SessionPhase};
pub use signal::{
    Detection, FilterSpec, FrequencyClassifier, Passthrough, PolledSampleSource, SignalConditioner,
};
