//! MMIO peripherals: CLINT, PLIC, UART, and the virtio-mmio block device.

pub mod clint;
pub mod plic;
pub mod uart;
pub mod virtio_blk;

pub use clint::Clint;
pub use plic::Plic;
pub use uart::Uart;
pub use virtio_blk::VirtioBlk;
