//! Resume support for interrupted dumps
//!
//! A [`ResumeState`] document records which sectors earlier runs captured and
//! which failed. At session start the [`ResumeReconciler`] decides whether a
//! stored document applies to the device being dumped and hands back a
//! [`ResumeSession`] the dump loop updates as it goes.

pub mod reconcile;
pub mod state;
pub mod store;

pub use reconcile::{DeviceProbe, ResumeError, ResumeReconciler, ResumeSession};
pub use state::{DumpHardwareAttempt, ResumeState, SoftwareIdentity};
pub use store::ResumeStore;
