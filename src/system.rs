//! System: wires RAM, the MMIO bus, CLINT/PLIC/UART/virtio-blk, and one or
//! more harts into the main step loop, running each device's periodic
//! work after every hart steps. Device aggregates that need both
//! register-style bus dispatch and direct-DMA/cross-device calls (PLIC
//! claim feeding `mip`, virtio's descriptor walk) are shared via
//! `Rc<RefCell<_>>` between their bus registration and the owning
//! `System`.

use std::cell::RefCell;
use std::rc::Rc;

use log::info;

use crate::bus::{Bus, MmioDevice};
use crate::config::MachineConfig;
use crate::cpu::csr;
use crate::cpu::Hart;
use crate::devices::{Clint, Plic, Uart, VirtioBlk};
use crate::error::{EmuError, EmuResult};
use crate::loader;
use crate::memory::Memory;

const DISK_SECTOR_SIZE: u64 = 512;

/// Thin `MmioDevice` delegate so a shared device can also be called
/// directly by `System` outside the bus dispatch path.
struct Shared<T>(Rc<RefCell<T>>);

impl<T: MmioDevice> MmioDevice for Shared<T> {
    fn read(&mut self, offset: u64, size: u8) -> u64 {
        self.0.borrow_mut().read(offset, size)
    }
    fn write(&mut self, offset: u64, value: u64, size: u8) {
        self.0.borrow_mut().write(offset, value, size)
    }
}

pub struct System {
    pub bus: Bus,
    pub harts: Vec<Hart>,
    clint: Rc<RefCell<Clint>>,
    plic: Rc<RefCell<Plic>>,
    virtio: Rc<RefCell<VirtioBlk>>,
    virtio_irq: u32,
    cycle: u64,
}

impl System {
    pub fn new(
        config: &MachineConfig,
        disk_image: Vec<u8>,
        host_io: Box<dyn crate::devices::uart::HostIo>,
    ) -> EmuResult<Self> {
        if disk_image.len() as u64 % DISK_SECTOR_SIZE != 0 {
            return Err(EmuError::BadDiskImageSize(disk_image.len() as u64));
        }

        let mut bus = Bus::new();
        bus.register_ram(config.ram_base, Memory::new(config.ram_size));

        let clint = Rc::new(RefCell::new(Clint::new()));
        bus.register_device(config.clint_base, config.clint_size, Box::new(Shared(Rc::clone(&clint))));

        let plic = Rc::new(RefCell::new(Plic::new()));
        bus.register_device(config.plic_base, config.plic_size, Box::new(Shared(Rc::clone(&plic))));

        let uart_plic = Rc::clone(&plic);
        let uart_irq = config.uart_irq;
        let uart = Uart::new(host_io, move |level| uart_plic.borrow_mut().set_irq(uart_irq, level));
        bus.register_device(config.uart_base, config.uart_size, Box::new(uart));

        let virtio = Rc::new(RefCell::new(VirtioBlk::new(disk_image)));
        bus.register_device(config.virtio_base, config.virtio_size, Box::new(Shared(Rc::clone(&virtio))));

        let harts = (0..config.hart_count)
            .map(|id| Hart::new(id as u64, config.tlb_size, config.ram_base))
            .collect();

        Ok(Self {
            bus,
            harts,
            clint,
            plic,
            virtio,
            virtio_irq: config.virtio_irq,
            cycle: 0,
        })
    }

    /// Loads an ELF64 image into RAM and points hart 0's `pc` at its entry
    /// point.
    pub fn load_kernel(&mut self, image: &[u8]) -> EmuResult<()> {
        let entry = loader::load(&mut self.bus, image)?;
        if let Some(hart) = self.harts.first_mut() {
            hart.pc = entry;
        }
        info!("loaded kernel, entry={entry:#x}");
        Ok(())
    }

    /// `ctx` convention: hart `h`'s Machine-mode context is `2h`, its
    /// Supervisor-mode context is `2h + 1`.
    fn plic_context(hart_index: usize, machine: bool) -> usize {
        hart_index * 2 + if machine { 0 } else { 1 }
    }

    /// One system tick: steps every hart, then runs device periodic work
    /// and re-derives each hart's `mip` bits.
    pub fn step(&mut self) {
        for hart in &mut self.harts {
            hart.step(&mut self.bus);
        }
        self.cycle = self.cycle.wrapping_add(1);

        let timer_pending = self.clint.borrow_mut().tick();
        let software_pending = self.clint.borrow().software_pending();

        self.virtio.borrow_mut().service_notifications(&mut self.bus, self.cycle);
        self.virtio.borrow_mut().drain_completions(&mut self.bus, self.cycle);
        let virtio_pending = self.virtio.borrow().interrupt_pending();
        self.plic.borrow_mut().set_irq(self.virtio_irq, virtio_pending);

        for (i, hart) in self.harts.iter_mut().enumerate() {
            let mip = hart.csrs.read_raw(csr::addr::MIP);
            let mut next = mip;
            set_bit(&mut next, csr::interrupt::MTIP, timer_pending);
            set_bit(&mut next, csr::interrupt::MSIP, software_pending);
            let m_ctx_pending = self.plic.borrow().context_has_pending(Self::plic_context(i, true));
            let s_ctx_pending = self.plic.borrow().context_has_pending(Self::plic_context(i, false));
            set_bit(&mut next, csr::interrupt::MEIP, m_ctx_pending || s_ctx_pending);
            if next != mip {
                hart.csrs.write_raw(csr::addr::MIP, next);
            }
        }
    }

    pub fn run_until_halted(&mut self) {
        while self.harts.iter().any(|h| h.running && !h.halted) {
            self.step();
        }
    }
}

fn set_bit(value: &mut u64, bit: u64, set: bool) {
    if set {
        *value |= bit;
    } else {
        *value &= !bit;
    }
}
