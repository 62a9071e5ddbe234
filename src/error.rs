//! Crate-wide error types.
//!
//! One `thiserror` enum per subsystem, following `carbon::kvm::KvmError`'s
//! pattern of a variant per failure mode with the underlying OS/ioctl error
//! attached via `#[source]`. [`KmError`] aggregates them for `main`.

use thiserror::Error;

pub use crate::elf::ElfError;
pub use crate::fork::ForkError;
pub use crate::gdb::GdbError;
pub use crate::kvm::KvmError;
pub use crate::mem::MemError;
pub use crate::signal::SignalError;

#[derive(Error, Debug)]
pub enum KmError {
    #[error(transparent)]
    Kvm(#[from] KvmError),

    #[error(transparent)]
    Mem(#[from] MemError),

    #[error(transparent)]
    Signal(#[from] SignalError),

    #[error(transparent)]
    Gdb(#[from] GdbError),

    #[error(transparent)]
    Fork(#[from] ForkError),

    #[error(transparent)]
    Elf(#[from] ElfError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
