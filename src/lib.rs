//! Transport and tempo synchronization between a host application
//! timeline and a shared, peer-negotiated session timeline.
//!
//! The host side (edit cursor, playhead, tempo map, play state) is
//! abstracted behind [`host::HostTimeline`]; the peer side behind
//! [`session::SessionFabric`]. [`engine::SyncEngine`] sits between them
//! and runs once per audio buffer: it launches playback on session
//! quantum boundaries, measures phase drift between the two timelines,
//! and corrects it either by re-mapping the session (master) or by
//! nudging the host playback rate (follower). [`engine::EngineHandle`]
//! is the thread-safe control surface.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tempolink::{MemorySession, SyncEngine};
//! # use tempolink::host::HostTimeline;
//! # fn host() -> Arc<dyn HostTimeline> { unimplemented!() }
//!
//! let session = Arc::new(MemorySession::new(120.0));
//! let (mut engine, handle) = SyncEngine::new(host(), session)?;
//! handle.set_enabled(true);
//! handle.set_puppet(true);
//! handle.start();
//! // from the audio callback:
//! engine.on_audio_buffer(512, 48_000.0);
//! # Ok::<(), tempolink::Error>(())
//! ```

pub mod clock;
pub mod control;
pub mod drift;
pub mod engine;
pub mod error;
pub mod filter;
pub mod host;
pub mod launch;
pub mod lockfree;
pub mod offsets;
pub mod session;
pub mod transport;
pub mod worker;

pub use clock::{Micros, Timeline};
pub use control::DEFAULT_QUANTUM;
pub use engine::{EngineHandle, SyncEngine, Telemetry, MAX_TEMPO, MIN_TEMPO};
pub use error::{Error, Result};
pub use host::{HostTimeline, PlayState, TempoMarker, TempoTimeSig};
pub use session::{MemorySession, SessionFabric, SessionState};
