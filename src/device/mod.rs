//! Device model.
//!
//! A [`Carrier`] owns its [`Module`]s ordered by site; site 1 is the master and owns
//! the global clock and trigger. Each module owns a fixed number of channels given by
//! its [`ModuleFamily`].
//!
//! Carriers are shared per host through the [`CarrierRegistry`].

pub mod awg;
pub mod carrier;
pub mod module;
pub mod registry;

pub use carrier::{Carrier, CarrierKind, ClockSetup, TriggerSetup};
pub use module::{Channel, Module, ModuleFamily, Timebase, TriggerMode};
pub use registry::{CarrierLease, CarrierRegistry};
