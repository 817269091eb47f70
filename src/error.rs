//! Process-fatal error types.
//!
//! Guest-visible faults (page faults, illegal instructions, ...) are not
//! represented here — they are [`crate::cpu::trap::Exception`] values that
//! are caught and turned into traps inside [`crate::cpu::Hart::step`] and
//! never escape it. `EmuError` is reserved for the "emulator-internal
//! errors" category: conditions that have no sensible guest-visible
//! recovery and should abort the host process with a diagnostic.

use std::io;

pub type EmuResult<T> = Result<T, EmuError>;

#[derive(Debug, thiserror::Error)]
pub enum EmuError {
    #[error("failed to read image file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("malformed ELF image: {0}")]
    MalformedElf(String),

    #[error("disk image size {0} is not a multiple of 512 bytes")]
    BadDiskImageSize(u64),
}
