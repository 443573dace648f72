//! Streaming engine.
//!
//! Captures larger than the on-board memory (or explicitly continuous ones) are read
//! live from up to two streaming lanes. Each lane gets a [`StreamWorker`] that reads
//! fixed-size chunks of channel-interleaved 16-bit rows, locates event markers to
//! recover trigger-aligned time offsets and hands every block to the storage sink.
//! The TCP receive window is the only backpressure: a worker holds one chunk at a
//! time.
//!
//! - [`marker`]: marker decoding and the [`TimeAligner`]
//! - [`worker`]: the per-lane reader
//! - [`session`]: per-shot grouping and the per-host registry

pub mod marker;
pub mod session;
pub mod worker;

pub use marker::{Block, EventMarker, MarkerKind, TimeAligner};
pub use session::{SessionKey, SessionRegistry, SessionReport, StreamSession};
pub use worker::{LaneChannel, LanePlan, LaneReport, StreamWorker};
