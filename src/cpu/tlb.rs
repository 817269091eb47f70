//! Software-managed TLB: fully-associative, `TLB_SIZE` entries, LRU via a
//! monotonic counter. Caches completed Sv39 translations keyed by
//! VPN/ASID/global-bit and is invalidated by `sfence.vma`.

#[derive(Debug, Clone, Copy)]
struct Entry {
    valid: bool,
    vpn: u64,
    asid: u64,
    global: bool,
    ppn: u64,
    readable: bool,
    writable: bool,
    executable: bool,
    user: bool,
    last_used: u64,
}

impl Entry {
    const EMPTY: Entry = Entry {
        valid: false,
        vpn: 0,
        asid: 0,
        global: false,
        ppn: 0,
        readable: false,
        writable: false,
        executable: false,
        user: false,
        last_used: 0,
    };
}

#[derive(Debug, Clone, Copy)]
pub struct TlbHit {
    pub ppn: u64,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub user: bool,
}

pub struct Tlb {
    entries: Vec<Entry>,
    clock: u64,
}

impl Tlb {
    pub fn new(size: usize) -> Self {
        Self { entries: vec![Entry::EMPTY; size], clock: 0 }
    }

    /// Lookup keyed on `(VPN, ASID, global-bit)`.
    pub fn lookup(&mut self, vpn: u64, asid: u64) -> Option<TlbHit> {
        self.clock += 1;
        let clock = self.clock;
        let found = self.entries.iter_mut().find(|e| {
            e.valid && e.vpn == vpn && (e.global || e.asid == asid)
        })?;
        found.last_used = clock;
        Some(TlbHit {
            ppn: found.ppn,
            readable: found.readable,
            writable: found.writable,
            executable: found.executable,
            user: found.user,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn insert(
        &mut self,
        vpn: u64,
        asid: u64,
        global: bool,
        ppn: u64,
        readable: bool,
        writable: bool,
        executable: bool,
        user: bool,
    ) {
        self.clock += 1;
        let clock = self.clock;
        let slot = self
            .entries
            .iter()
            .position(|e| !e.valid)
            .unwrap_or_else(|| {
                self.entries
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, e)| e.last_used)
                    .map(|(i, _)| i)
                    .unwrap()
            });
        self.entries[slot] = Entry {
            valid: true,
            vpn,
            asid,
            global,
            ppn,
            readable,
            writable,
            executable,
            user,
            last_used: clock,
        };
    }

    /// `SFENCE.VMA` semantics. `vaddr`/`asid` of `None` mean "all" for
    /// that dimension; both `None` flushes everything including global
    /// entries.
    pub fn fence(&mut self, vpn: Option<u64>, asid: Option<u64>) {
        if vpn.is_none() && asid.is_none() {
            for e in self.entries.iter_mut() {
                *e = Entry::EMPTY;
            }
            return;
        }
        for e in self.entries.iter_mut() {
            if !e.valid {
                continue;
            }
            let vpn_matches = vpn.map_or(true, |v| e.vpn == v);
            let asid_matches = asid.map_or(true, |a| e.asid == a);
            if vpn_matches && asid_matches && !(asid.is_some() && e.global) {
                *e = Entry::EMPTY;
            }
        }
    }

    /// Conservative flush used on every `satp` write: drop all non-global
    /// entries, since a new address space may reuse any VPN.
    pub fn flush_non_global(&mut self) {
        for e in self.entries.iter_mut() {
            if e.valid && !e.global {
                *e = Entry::EMPTY;
            }
        }
    }
}
