//! Reproduces a received snapshot on the live character a peer is rendered
//! as.
//!
//! For every sub-object kind that changed, in the fixed order of
//! [`ObjectKind`](veneer_host::ObjectKind):
//!
//! 1. resolve the live object again (never reuse an old address),
//! 2. register the remap table and manipulation data in a uniquely named
//!    temporary collection assigned to the object,
//! 3. wait until the object is neither loading nor drawing,
//! 4. apply the cosmetic overrides: skeleton offset, body scale, pose,
//! 5. redraw and wait for the redraw to finish,
//! 6. release the temporary collection, whatever happened in between.
//!
//! [`ApplyPipeline::revert`] undoes all of it, including whatever a
//! cancelled apply had already done.

pub mod error;
mod pipeline;
mod remap;
mod settings;

pub use crate::pipeline::{ApplyOutcome, ApplyPipeline, ApplyReport, RevertReport};
pub use crate::remap::RemapTable;
pub use crate::settings::ApplySettings;
