//! 16550-style UART: byte-wide register file behind a mutex, a bounded
//! TX/RX ring each, and two long-lived worker threads driving the host
//! side. Host I/O is abstracted behind `HostIo` so tests can swap in an
//! in-memory loopback instead of real stdin/stdout.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use log::{trace, warn};

use crate::bus::MmioDevice;

pub const REG_DATA: u64 = 0; // RBR (read) / THR (write) / DLL when DLAB
pub const REG_IER: u64 = 1; // interrupt enable / DLM when DLAB
pub const REG_IIR: u64 = 2;
pub const REG_LCR: u64 = 3;
pub const REG_MCR: u64 = 4;
pub const REG_LSR: u64 = 5;
pub const REG_MSR: u64 = 6;
pub const REG_SCR: u64 = 7;

pub mod ier {
    pub const RX_ENABLE: u8 = 1 << 0;
    pub const TX_ENABLE: u8 = 1 << 1;
}

pub mod lsr {
    pub const DR: u8 = 1 << 0;
    pub const OE: u8 = 1 << 1;
    pub const THRE: u8 = 1 << 5;
    pub const TEMT: u8 = 1 << 6;
}

const LCR_DLAB: u8 = 1 << 7;
const RING_CAPACITY: usize = 16;

/// Host-side terminal boundary: whatever drives the real terminal (stdio,
/// a pty, a test loopback) plugs in through this trait.
pub trait HostIo: Send {
    fn write(&mut self, byte: u8);
    /// Returns `None` when no byte is currently available.
    fn read_nonblocking(&mut self) -> Option<u8>;
}

struct Registers {
    ier: u8,
    lcr: u8,
    mcr: u8,
    lsr: u8,
    msr: u8,
    scr: u8,
    dll: u8,
    dlm: u8,
    tx: VecDeque<u8>,
    rx: VecDeque<u8>,
    running: bool,
    irq_line: bool,
}

impl Default for Registers {
    fn default() -> Self {
        Self {
            ier: 0,
            lcr: 0,
            mcr: 0,
            lsr: lsr::THRE | lsr::TEMT,
            msr: 0,
            scr: 0,
            dll: 0,
            dlm: 0,
            tx: VecDeque::with_capacity(RING_CAPACITY),
            rx: VecDeque::with_capacity(RING_CAPACITY),
            running: true,
            irq_line: false,
        }
    }
}

impl Registers {
    fn update_lsr(&mut self) {
        if self.rx.is_empty() {
            self.lsr &= !lsr::DR;
        } else {
            self.lsr |= lsr::DR;
        }
        if self.tx.is_empty() {
            self.lsr |= lsr::THRE | lsr::TEMT;
        } else {
            self.lsr &= !(lsr::THRE | lsr::TEMT);
        }
    }

    /// `(IER.RX_ENABLE ∧ LSR.DR) ∨ (IER.TX_ENABLE ∧ LSR.THRE)`.
    fn interrupt_asserted(&self) -> bool {
        (self.ier & ier::RX_ENABLE != 0 && self.lsr & lsr::DR != 0)
            || (self.ier & ier::TX_ENABLE != 0 && self.lsr & lsr::THRE != 0)
    }
}

struct Shared {
    regs: Mutex<Registers>,
    tx_cond: Condvar,
}

/// Bus-facing handle. Cloneable only via the `Arc` inside; owns the worker
/// threads and joins them on drop.
pub struct Uart {
    shared: Arc<Shared>,
    irq_callback: Box<dyn FnMut(bool) + Send>,
    tx_thread: Option<JoinHandle<()>>,
    rx_thread: Option<JoinHandle<()>>,
}

impl Uart {
    /// `irq_callback` is invoked on every edge transition of the interrupt
    /// line, e.g. to drive `Plic::set_irq`.
    pub fn new(host: Box<dyn HostIo>, irq_callback: impl FnMut(bool) + Send + 'static) -> Self {
        let shared = Arc::new(Shared {
            regs: Mutex::new(Registers::default()),
            tx_cond: Condvar::new(),
        });

        let (host_tx, host_rx) = split_host(host);

        let tx_shared = Arc::clone(&shared);
        let tx_thread = thread::spawn(move || tx_worker(tx_shared, host_tx));

        let rx_shared = Arc::clone(&shared);
        let rx_thread = thread::spawn(move || rx_worker(rx_shared, host_rx));

        Self {
            shared,
            irq_callback: Box::new(irq_callback),
            tx_thread: Some(tx_thread),
            rx_thread: Some(rx_thread),
        }
    }

    fn refresh_irq(&mut self, was_asserted: bool) {
        let regs = self.shared.regs.lock().unwrap();
        let now_asserted = regs.interrupt_asserted();
        drop(regs);
        if now_asserted != was_asserted {
            (self.irq_callback)(now_asserted);
        }
    }
}

impl Drop for Uart {
    fn drop(&mut self) {
        {
            let mut regs = self.shared.regs.lock().unwrap();
            regs.running = false;
        }
        self.shared.tx_cond.notify_all();
        if let Some(h) = self.tx_thread.take() {
            let _ = h.join();
        }
        if let Some(h) = self.rx_thread.take() {
            let _ = h.join();
        }
    }
}

/// Splits a boxed `HostIo` into independent TX/RX halves so each worker
/// thread can own one without contending on the other's calls. The host
/// collaborator itself serializes reads/writes internally.
fn split_host(host: Box<dyn HostIo>) -> (Arc<Mutex<Box<dyn HostIo>>>, Arc<Mutex<Box<dyn HostIo>>>) {
    let shared = Arc::new(Mutex::new(host));
    (Arc::clone(&shared), shared)
}

fn tx_worker(shared: Arc<Shared>, host: Arc<Mutex<Box<dyn HostIo>>>) {
    loop {
        let byte = {
            let mut regs = shared.regs.lock().unwrap();
            loop {
                if !regs.running && regs.tx.is_empty() {
                    return;
                }
                if let Some(b) = regs.tx.pop_front() {
                    regs.update_lsr();
                    break b;
                }
                regs = shared.tx_cond.wait(regs).unwrap();
            }
        };
        host.lock().unwrap().write(byte);
    }
}

fn rx_worker(shared: Arc<Shared>, host: Arc<Mutex<Box<dyn HostIo>>>) {
    loop {
        let running = shared.regs.lock().unwrap().running;
        if !running {
            return;
        }
        let byte = host.lock().unwrap().read_nonblocking();
        if let Some(b) = byte {
            let mut regs = shared.regs.lock().unwrap();
            if regs.rx.len() >= RING_CAPACITY {
                regs.rx.pop_front();
                regs.lsr |= lsr::OE;
                warn!("uart rx overflow, dropping oldest byte");
            }
            regs.rx.push_back(b);
            regs.update_lsr();
        } else {
            thread::yield_now();
        }
    }
}

impl MmioDevice for Uart {
    fn read(&mut self, offset: u64, _size: u8) -> u64 {
        let was_asserted;
        let value = {
            let mut regs = self.shared.regs.lock().unwrap();
            was_asserted = regs.interrupt_asserted();
            let dlab = regs.lcr & LCR_DLAB != 0;
            match offset {
                REG_DATA if dlab => regs.dll,
                REG_DATA => {
                    let b = regs.rx.pop_front().unwrap_or(0);
                    regs.update_lsr();
                    b
                }
                REG_IER if dlab => regs.dlm,
                REG_IER => regs.ier,
                REG_IIR => 0,
                REG_LCR => regs.lcr,
                REG_MCR => regs.mcr,
                REG_LSR => regs.lsr,
                REG_MSR => regs.msr,
                REG_SCR => regs.scr,
                _ => 0,
            }
        };
        self.refresh_irq(was_asserted);
        trace!("uart read offset={offset} -> {value:#x}");
        value as u64
    }

    fn write(&mut self, offset: u64, value: u64, _size: u8) {
        let byte = value as u8;
        let was_asserted;
        {
            let mut regs = self.shared.regs.lock().unwrap();
            was_asserted = regs.interrupt_asserted();
            let dlab = regs.lcr & LCR_DLAB != 0;
            match offset {
                REG_DATA if dlab => regs.dll = byte,
                REG_DATA => {
                    if regs.tx.len() >= RING_CAPACITY {
                        regs.tx.pop_front();
                    }
                    regs.tx.push_back(byte);
                    regs.update_lsr();
                    self.shared.tx_cond.notify_one();
                }
                REG_IER if dlab => regs.dlm = byte,
                REG_IER => regs.ier = byte & 0x0f,
                REG_LCR => regs.lcr = byte,
                REG_MCR => regs.mcr = byte & 0x1f,
                REG_SCR => regs.scr = byte,
                _ => {}
            }
        }
        self.refresh_irq(was_asserted);
    }
}
