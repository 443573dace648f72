//! The "knob" command protocol.
//!
//! Carriers and their modules expose their configuration as a tree of named knobs
//! (`TRANSIENT:PRE`, `SYS:CLK:FPMUX`, `ACQ480:GAIN:03`, ...) reached over a text
//! request/response protocol on a per-site TCP port.
//!
//! - [`value`]: casting between knob text and Rust types
//! - [`schema`]: typed knob declarations grouped per device family
//! - [`cache`]: the settings audit kept during an init transaction
//! - [`client`]: the connection-owning client with chain transactions

pub mod cache;
pub mod client;
pub mod schema;
pub mod value;

pub use cache::SettingsCache;
pub use client::CommandClient;
pub use schema::{Access, IndexedKnob, Knob, KnobSchema, KnobSpec};
pub use value::{KnobKind, KnobType};
