//! Typed VMCS fields
//!
//! The VMCS is accessed through a single read/write primitive, [`VmcsAccess`]. The fields are
//! grouped by category in extension traits implemented for every `VmcsAccess`:
//!
//! - [`ControlFields`]: execution, entry and exit controls, bitmaps and pointers.
//! - [`GuestFields`]: guest-state area.
//! - [`HostFields`]: host-state area.
//! - [`EntryFields`]: event injection for the next VM entry.
//! - [`ExitFields`]: read-only VM exit information.
//!
//! All accessors operate on the VMCS currently loaded on the calling processor.

mod control;
mod entry;
mod exit;
mod guest;
mod host;

use vmx::{VmcsField, VmxError};

pub use control::{ControlFields, ControlMsr};
pub use entry::EntryFields;
pub use exit::ExitFields;
pub use guest::GuestFields;
pub use host::HostFields;

/// Read and write access to the current VMCS.
pub trait VmcsAccess {
    fn vmcs_read(&self, field: VmcsField) -> Result<u64, VmxError>;
    fn vmcs_write(&mut self, field: VmcsField, value: u64) -> Result<(), VmxError>;
}
