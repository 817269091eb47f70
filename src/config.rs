//! Machine configuration: MMIO base addresses, RAM layout, hart count.
//!
//! Mirrors the default physical memory map from the platform this emulator
//! targets (QEMU `virt`-style layout):
//!
//! ```text
//! 0x0200_0000 + 0x0001_0000   CLINT
//! 0x0c00_0000 + 0x0400_0000   PLIC
//! 0x1000_0000 + 0x0000_0100   UART0 (16550)
//! 0x1000_1000 + 0x0000_1000   virtio-mmio block
//! 0x8000_0000 + N             RAM
//! ```

/// Default UART interrupt source on the PLIC.
pub const UART_IRQ: u32 = 10;
/// Default virtio-blk interrupt source on the PLIC.
pub const VIRTIO_IRQ: u32 = 1;

/// Default software-managed TLB capacity.
pub const DEFAULT_TLB_SIZE: usize = 64;

/// Default RAM size when none is specified (128 MiB).
pub const DEFAULT_RAM_SIZE: u64 = 128 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub ram_base: u64,
    pub ram_size: u64,

    pub clint_base: u64,
    pub clint_size: u64,

    pub plic_base: u64,
    pub plic_size: u64,

    pub uart_base: u64,
    pub uart_size: u64,
    pub uart_irq: u32,

    pub virtio_base: u64,
    pub virtio_size: u64,
    pub virtio_irq: u32,

    pub hart_count: usize,
    pub tlb_size: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            ram_base: 0x8000_0000,
            ram_size: DEFAULT_RAM_SIZE,

            clint_base: 0x0200_0000,
            clint_size: 0x0001_0000,

            plic_base: 0x0c00_0000,
            plic_size: 0x0400_0000,

            uart_base: 0x1000_0000,
            uart_size: 0x100,
            uart_irq: UART_IRQ,

            virtio_base: 0x1000_1000,
            virtio_size: 0x1000,
            virtio_irq: VIRTIO_IRQ,

            hart_count: 1,
            tlb_size: DEFAULT_TLB_SIZE,
        }
    }
}

impl MachineConfig {
    pub fn with_ram_size(mut self, size: u64) -> Self {
        self.ram_size = size;
        self
    }
}
