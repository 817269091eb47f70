//! Virtio-MMIO block device, modern (v2) split-virtqueue layout. Register
//! dispatch is a dedicated MMIO register file plus a direct-DMA service
//! routine invoked by the main loop, rather than doing descriptor-chain
//! walks from inside `MmioDevice::write` (which has no bus access).

use std::collections::VecDeque;

use log::{debug, warn};

use crate::bus::{Bus, MmioDevice};

const MAGIC: u32 = 0x7472_6976; // "virt" little-endian
const VERSION: u32 = 2;
const DEVICE_ID_BLOCK: u32 = 2;
const VENDOR_ID: u32 = 0x554d_4551;

const REG_MAGIC: u64 = 0x000;
const REG_VERSION: u64 = 0x004;
const REG_DEVICE_ID: u64 = 0x008;
const REG_VENDOR_ID: u64 = 0x00c;
const REG_DEVICE_FEATURES: u64 = 0x010;
const REG_DEVICE_FEATURES_SEL: u64 = 0x014;
const REG_DRIVER_FEATURES: u64 = 0x020;
const REG_DRIVER_FEATURES_SEL: u64 = 0x024;
const REG_QUEUE_SEL: u64 = 0x030;
const REG_QUEUE_NUM_MAX: u64 = 0x034;
const REG_QUEUE_NUM: u64 = 0x038;
const REG_QUEUE_READY: u64 = 0x044;
const REG_QUEUE_NOTIFY: u64 = 0x050;
const REG_INTERRUPT_STATUS: u64 = 0x060;
const REG_INTERRUPT_ACK: u64 = 0x064;
const REG_STATUS: u64 = 0x070;
const REG_QUEUE_DESC_LOW: u64 = 0x080;
const REG_QUEUE_DESC_HIGH: u64 = 0x084;
const REG_QUEUE_DRIVER_LOW: u64 = 0x090;
const REG_QUEUE_DRIVER_HIGH: u64 = 0x094;
const REG_QUEUE_DEVICE_LOW: u64 = 0x0a0;
const REG_QUEUE_DEVICE_HIGH: u64 = 0x0a4;
const REG_CONFIG: u64 = 0x100;

const SECTOR_SIZE: u64 = 512;
const QUEUE_NUM_MAX: u32 = 256;
const REQ_TYPE_IN: u32 = 0;
const REQ_TYPE_OUT: u32 = 1;
const DESC_SIZE: u64 = 16;
/// Cycles between a notification being serviced and its completion being
/// published. Deferred so a guest driver observes genuinely asynchronous
/// I/O rather than instant completion.
const COMPLETION_LATENCY: u64 = 8;

struct PendingOp {
    head: u16,
    req_type: u32,
    sector: u64,
    data_addr: u64,
    data_len: u32,
    status_addr: u64,
    complete_at_cycle: u64,
}

pub struct VirtioBlk {
    device_features_sel: u32,
    driver_features: u32,
    driver_features_sel: u32,
    queue_num: u32,
    queue_ready: bool,
    queue_desc: u64,
    queue_driver: u64,
    queue_device: u64,
    interrupt_status: u32,
    status: u32,
    disk: Vec<u8>,
    avail_cursor: u16,
    used_idx: u16,
    pending: VecDeque<PendingOp>,
}

impl VirtioBlk {
    pub fn new(disk: Vec<u8>) -> Self {
        Self {
            device_features_sel: 0,
            driver_features: 0,
            driver_features_sel: 0,
            queue_num: 0,
            queue_ready: false,
            queue_desc: 0,
            queue_driver: 0,
            queue_device: 0,
            interrupt_status: 0,
            status: 0,
            disk,
            avail_cursor: 0,
            used_idx: 0,
            pending: VecDeque::new(),
        }
    }

    /// Level-triggered: stays asserted until the driver acks via
    /// `INTERRUPT_ACK`, independent of whether a completion just ran.
    pub fn interrupt_pending(&self) -> bool {
        self.interrupt_status != 0
    }

    fn capacity_sectors(&self) -> u64 {
        self.disk.len() as u64 / SECTOR_SIZE
    }

    fn set_low(value: &mut u64, half: u32) {
        *value = (*value & 0xffff_ffff_0000_0000) | half as u64;
    }

    fn set_high(value: &mut u64, half: u32) {
        *value = (*value & 0xffff_ffff) | ((half as u64) << 32);
    }

    /// Walks newly-available descriptor chains and arms completion records
    /// with bus-supplied DMA. Call once per emulated step before
    /// [`VirtioBlk::drain_completions`].
    pub fn service_notifications(&mut self, bus: &mut Bus, current_cycle: u64) {
        if !self.queue_ready || self.queue_num == 0 {
            return;
        }
        let avail_idx = bus.read(self.queue_driver.wrapping_add(2), 2) as u16;
        while self.avail_cursor != avail_idx {
            let ring_slot = self.queue_driver + 4 + (self.avail_cursor as u64 % self.queue_num as u64) * 2;
            let head = bus.read(ring_slot, 2) as u16;
            if let Some(op) = self.parse_chain(bus, head) {
                self.pending.push_back(PendingOp {
                    complete_at_cycle: current_cycle + COMPLETION_LATENCY,
                    ..op
                });
            }
            self.avail_cursor = self.avail_cursor.wrapping_add(1);
        }
    }

    fn descriptor(bus: &mut Bus, desc_table: u64, index: u16) -> (u64, u32, u16, u16) {
        let base = desc_table + index as u64 * DESC_SIZE;
        let addr = bus.read(base, 8);
        let len = bus.read(base + 8, 4) as u32;
        let flags = bus.read(base + 12, 2) as u16;
        let next = bus.read(base + 14, 2) as u16;
        (addr, len, flags, next)
    }

    /// Interprets a descriptor chain as `[header, data, status]`.
    fn parse_chain(&self, bus: &mut Bus, head: u16) -> Option<PendingOp> {
        const NEXT: u16 = 1;

        let (header_addr, _header_len, header_flags, next) = Self::descriptor(bus, self.queue_desc, head);
        if header_flags & NEXT == 0 {
            warn!("virtio-blk: header descriptor {head} missing NEXT flag");
            return None;
        }
        let req_type = bus.read(header_addr, 4) as u32;
        let sector = bus.read(header_addr.wrapping_add(8), 8);

        let (data_addr, data_len, data_flags, next2) = Self::descriptor(bus, self.queue_desc, next);
        if data_flags & NEXT == 0 {
            warn!("virtio-blk: data descriptor missing NEXT flag");
            return None;
        }

        let (status_addr, _status_len, _status_flags, _) = Self::descriptor(bus, self.queue_desc, next2);

        Some(PendingOp {
            head,
            req_type,
            sector,
            data_addr,
            data_len,
            status_addr,
            complete_at_cycle: 0,
        })
    }

    /// Performs the deferred transfer and used-ring publication for any
    /// operation whose deadline has passed. Returns `true` if the
    /// interrupt line should be asserted.
    pub fn drain_completions(&mut self, bus: &mut Bus, current_cycle: u64) -> bool {
        let mut raised = false;
        while let Some(op) = self.pending.front() {
            if op.complete_at_cycle > current_cycle {
                break;
            }
            let op = self.pending.pop_front().unwrap();
            let status = self.complete_operation(bus, &op);
            bus.write(op.status_addr, status as u64, 1);

            let used_slot = self.queue_device + 4 + (self.used_idx as u64 % self.queue_num as u64) * 8;
            bus.write(used_slot, op.head as u64, 4);
            bus.write(used_slot + 4, SECTOR_SIZE, 4);
            self.used_idx = self.used_idx.wrapping_add(1);
            bus.write(self.queue_device.wrapping_add(2), self.used_idx as u64, 2);

            self.interrupt_status |= 0x1;
            raised = true;
            debug!("virtio-blk completed head={} sector={}", op.head, op.sector);
        }
        raised
    }

    fn complete_operation(&mut self, bus: &mut Bus, op: &PendingOp) -> u8 {
        let offset = op.sector * SECTOR_SIZE;
        if offset + op.data_len as u64 > self.disk.len() as u64 {
            warn!("virtio-blk: sector {} out of bounds", op.sector);
            return 1;
        }
        match op.req_type {
            REQ_TYPE_IN => {
                let mut buf = vec![0u8; op.data_len as usize];
                buf.copy_from_slice(&self.disk[offset as usize..offset as usize + op.data_len as usize]);
                if bus.ram_write_bytes(op.data_addr, &buf) {
                    0
                } else {
                    1
                }
            }
            REQ_TYPE_OUT => {
                let mut buf = vec![0u8; op.data_len as usize];
                if bus.ram_read_bytes(op.data_addr, &mut buf) {
                    self.disk[offset as usize..offset as usize + op.data_len as usize].copy_from_slice(&buf);
                    0
                } else {
                    1
                }
            }
            _ => 1,
        }
    }
}

impl MmioDevice for VirtioBlk {
    fn read(&mut self, offset: u64, size: u8) -> u64 {
        let value = match offset {
            REG_MAGIC => MAGIC,
            REG_VERSION => VERSION,
            REG_DEVICE_ID => DEVICE_ID_BLOCK,
            REG_VENDOR_ID => VENDOR_ID,
            REG_DEVICE_FEATURES => 0,
            REG_QUEUE_NUM_MAX => QUEUE_NUM_MAX,
            REG_QUEUE_READY => self.queue_ready as u32,
            REG_INTERRUPT_STATUS => self.interrupt_status,
            REG_STATUS => self.status,
            REG_QUEUE_DESC_LOW => self.queue_desc as u32,
            REG_QUEUE_DESC_HIGH => (self.queue_desc >> 32) as u32,
            REG_QUEUE_DRIVER_LOW => self.queue_driver as u32,
            REG_QUEUE_DRIVER_HIGH => (self.queue_driver >> 32) as u32,
            REG_QUEUE_DEVICE_LOW => self.queue_device as u32,
            REG_QUEUE_DEVICE_HIGH => (self.queue_device >> 32) as u32,
            o if (REG_CONFIG..REG_CONFIG + 8).contains(&o) => {
                let capacity = self.capacity_sectors();
                let shift = (o - REG_CONFIG) * 8;
                if shift < 64 {
                    (capacity >> shift) as u32
                } else {
                    0
                }
            }
            _ => 0,
        };
        if size == 8 { value as u64 } else { (value as u64) & mask(size) }
    }

    fn write(&mut self, offset: u64, value: u64, _size: u8) {
        let v32 = value as u32;
        match offset {
            REG_DEVICE_FEATURES_SEL => self.device_features_sel = v32,
            REG_DRIVER_FEATURES => self.driver_features = v32,
            REG_DRIVER_FEATURES_SEL => self.driver_features_sel = v32,
            REG_QUEUE_SEL => {
                if v32 != 0 {
                    warn!("virtio-blk: only queue 0 is supported, got QueueSel={v32}");
                }
            }
            REG_QUEUE_NUM => self.queue_num = v32,
            REG_QUEUE_READY => self.queue_ready = v32 & 1 != 0,
            REG_QUEUE_NOTIFY => {} // descriptor walk happens in service_notifications
            REG_INTERRUPT_ACK => self.interrupt_status &= !v32,
            REG_STATUS => {
                self.status = v32;
                if self.status == 0 {
                    self.reset();
                }
            }
            REG_QUEUE_DESC_LOW => Self::set_low(&mut self.queue_desc, v32),
            REG_QUEUE_DESC_HIGH => Self::set_high(&mut self.queue_desc, v32),
            REG_QUEUE_DRIVER_LOW => Self::set_low(&mut self.queue_driver, v32),
            REG_QUEUE_DRIVER_HIGH => Self::set_high(&mut self.queue_driver, v32),
            REG_QUEUE_DEVICE_LOW => Self::set_low(&mut self.queue_device, v32),
            REG_QUEUE_DEVICE_HIGH => Self::set_high(&mut self.queue_device, v32),
            _ => {}
        }
    }
}

impl VirtioBlk {
    fn reset(&mut self) {
        self.interrupt_status = 0;
        self.queue_ready = false;
        self.avail_cursor = 0;
        self.used_idx = 0;
        self.pending.clear();
    }
}

fn mask(size: u8) -> u64 {
    match size {
        1 => 0xff,
        2 => 0xffff,
        4 => 0xffff_ffff,
        _ => u64::MAX,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Memory;

    fn bus_with_ram() -> Bus {
        let mut bus = Bus::new();
        bus.register_ram(0, Memory::new(1 << 20));
        bus
    }

    fn setup_queue(bus: &mut Bus, desc: u64, driver: u64, device: u64, queue_num: u32) -> VirtioBlk {
        let mut dev = VirtioBlk::new(vec![0u8; 4096]);
        dev.write(REG_QUEUE_NUM, queue_num as u64, 4);
        dev.write(REG_QUEUE_DESC_LOW, desc, 4);
        dev.write(REG_QUEUE_DRIVER_LOW, driver, 4);
        dev.write(REG_QUEUE_DEVICE_LOW, device, 4);
        dev.write(REG_QUEUE_READY, 1, 4);
        let _ = bus;
        dev
    }

    fn write_desc(bus: &mut Bus, table: u64, index: u16, addr: u64, len: u32, flags: u16, next: u16) {
        let base = table + index as u64 * DESC_SIZE;
        bus.write(base, addr, 8);
        bus.write(base + 8, len as u64, 4);
        bus.write(base + 12, flags as u64, 2);
        bus.write(base + 14, next as u64, 2);
    }

    #[test]
    fn magic_version_device_id_match_spec() {
        let mut dev = VirtioBlk::new(vec![0u8; 512]);
        assert_eq!(dev.read(REG_MAGIC, 4), MAGIC as u64);
        assert_eq!(dev.read(REG_VERSION, 4), 2);
        assert_eq!(dev.read(REG_DEVICE_ID, 4), 2);
    }

    #[test]
    fn read_request_copies_disk_into_guest_memory_after_latency() {
        let mut bus = bus_with_ram();
        let desc_table = 0x1000;
        let driver_area = 0x2000;
        let device_area = 0x3000;
        let header_addr = 0x4000;
        let data_addr = 0x5000;
        let status_addr = 0x6000;

        let mut disk = vec![0u8; 4096];
        disk[512..516].copy_from_slice(&[1, 2, 3, 4]);
        let mut dev = VirtioBlk::new(disk);
        dev.write(REG_QUEUE_NUM, 8, 4);
        dev.write(REG_QUEUE_DESC_LOW, desc_table, 4);
        dev.write(REG_QUEUE_DRIVER_LOW, driver_area, 4);
        dev.write(REG_QUEUE_DEVICE_LOW, device_area, 4);
        dev.write(REG_QUEUE_READY, 1, 4);

        bus.write(header_addr, REQ_TYPE_IN as u64, 4);
        bus.write(header_addr + 8, 1, 8); // sector 1

        write_desc(&mut bus, desc_table, 0, header_addr, 16, 1, 1);
        write_desc(&mut bus, desc_table, 1, data_addr, 512, 1 | 2, 2);
        write_desc(&mut bus, desc_table, 2, status_addr, 1, 0, 0);

        bus.write(driver_area + 4, 0, 2); // ring[0] = head 0
        bus.write(driver_area + 2, 1, 2); // avail.idx = 1

        dev.service_notifications(&mut bus, 0);
        assert!(!dev.drain_completions(&mut bus, 0));
        let raised = dev.drain_completions(&mut bus, COMPLETION_LATENCY);
        assert!(raised);

        assert_eq!(bus.read(data_addr, 4), 0x0403_0201);
        assert_eq!(bus.read(status_addr, 1), 0);
        assert_eq!(dev.read(REG_INTERRUPT_STATUS, 4), 1);
    }

    #[test]
    fn used_idx_advances_strictly_after_used_entry_is_written() {
        // A driver polling `used.idx` must never observe it pointing at a
        // slot whose `{id,len}` pair hasn't been written yet. Asserted
        // indirectly: after draining, the entry at the just-published slot
        // matches the head that was notified.
        let mut bus = bus_with_ram();
        let mut dev = setup_queue(&mut bus, 0x100, 0x200, 0x300, 4);
        write_desc(&mut bus, 0x100, 0, 0x400, 16, 1, 1);
        write_desc(&mut bus, 0x100, 1, 0x500, 512, 1, 2);
        write_desc(&mut bus, 0x100, 2, 0x600, 1, 0, 0);
        bus.write(0x400, REQ_TYPE_OUT as u64, 4);
        bus.write(0x200 + 4, 0, 2);
        bus.write(0x200 + 2, 1, 2);

        dev.service_notifications(&mut bus, 10);
        dev.drain_completions(&mut bus, 10 + COMPLETION_LATENCY);

        let used_idx = bus.read(0x300 + 2, 2);
        assert_eq!(used_idx, 1);
        let published_head = bus.read(0x300 + 4, 4);
        assert_eq!(published_head, 0);
    }
}
