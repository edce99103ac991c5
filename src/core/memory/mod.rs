use std::fs::File;
use std::io::Write as _;

use tracing::{error, warn};

use crate::core::except::Except;

/// Typed accessors a device or RAM bank exposes to the bus. Offsets are
/// relative to the area base and already masked to the area size. The whole
/// simulator can be handed to a worker thread, so implementations are Send.
pub trait MemOps: Send {
    fn read8(&mut self, off: u32) -> u8;
    fn read16(&mut self, off: u32) -> u16;
    fn read32(&mut self, off: u32) -> u32;
    fn write8(&mut self, off: u32, val: u8);
    fn write16(&mut self, off: u32, val: u16);
    fn write32(&mut self, off: u32, val: u32);
    /// CPU stores to a read-only area raise a bus error. The program-write
    /// back door used by the loader and the debugger ignores this.
    fn writeable(&self) -> bool {
        true
    }
}

/// Plain big-endian RAM.
pub struct Ram {
    data: Vec<u8>,
    readonly: bool,
}

impl Ram {
    pub fn new(size: usize, readonly: bool) -> Self {
        Ram {
            data: vec![0; size],
            readonly,
        }
    }

    pub fn fill_pattern(&mut self, pattern: u8) {
        self.data.fill(pattern);
    }

    pub fn fill_random(&mut self, seed: u32) {
        // xorshift is plenty for scrambling uninitialised memory
        let mut state = seed | 1;
        for b in self.data.iter_mut() {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            *b = state as u8;
        }
    }
}

impl MemOps for Ram {
    fn read8(&mut self, off: u32) -> u8 {
        self.data[off as usize]
    }

    fn read16(&mut self, off: u32) -> u16 {
        let off = off as usize;
        u16::from_be_bytes([self.data[off], self.data[off + 1]])
    }

    fn read32(&mut self, off: u32) -> u32 {
        let off = off as usize;
        u32::from_be_bytes([
            self.data[off],
            self.data[off + 1],
            self.data[off + 2],
            self.data[off + 3],
        ])
    }

    fn write8(&mut self, off: u32, val: u8) {
        self.data[off as usize] = val;
    }

    fn write16(&mut self, off: u32, val: u16) {
        self.data[off as usize..off as usize + 2].copy_from_slice(&val.to_be_bytes());
    }

    fn write32(&mut self, off: u32, val: u32) {
        self.data[off as usize..off as usize + 4].copy_from_slice(&val.to_be_bytes());
    }

    fn writeable(&self) -> bool {
        !self.readonly
    }
}

pub struct MemArea {
    addr_mask: u32,
    addr_compare: u32,
    size: u32,
    size_mask: u32,
    pub delayr: i64,
    pub delayw: i64,
    pub log: Option<File>,
    /// Under memory-controller control an area can be switched off.
    pub valid: bool,
    ops: Box<dyn MemOps>,
}

impl MemArea {
    pub fn contains(&self, addr: u32) -> bool {
        (addr & self.addr_mask) == (self.addr_compare & self.addr_mask)
    }

    pub fn start(&self) -> u32 {
        self.addr_compare
    }

    pub fn size(&self) -> u32 {
        self.size
    }
}

/// The physical memory map: an ordered list of disjoint power-of-two sized
/// areas with a one-entry lookup cache. The memory-controller area, if any,
/// is probed before everything else.
pub struct MemoryMap {
    areas: Vec<MemArea>,
    mc_area: Option<usize>,
    cur_area: Option<usize>,
    pub report_errs: bool,
}

fn size_mask(size: u32) -> u32 {
    let mut mask = size - 1;
    let mut i = 0;
    while (mask >> i) != 0 {
        mask |= 1 << i;
        i += 1;
    }
    mask
}

impl MemoryMap {
    pub fn new() -> Self {
        MemoryMap {
            areas: Vec::new(),
            mc_area: None,
            cur_area: None,
            report_errs: false,
        }
    }

    /// Install an area, rounded up to the next power-of-two boundary.
    /// Overlap is a configuration error.
    pub fn reg_mem_area(
        &mut self,
        addr: u32,
        size: u32,
        mc: bool,
        ops: Box<dyn MemOps>,
    ) -> Result<usize, String> {
        let size_mask = size_mask(size);
        let addr_mask = !size_mask;
        let addr_compare = addr & addr_mask;
        let rounded = size_mask.wrapping_add(1);

        for a in &self.areas {
            let a_end = a.addr_compare as u64 + a.size as u64;
            let new_end =
                addr_compare as u64 + if rounded == 0 { 1u64 << 32 } else { rounded as u64 };
            if (addr_compare as u64) < a_end && new_end > a.addr_compare as u64 {
                return Err(format!(
                    "overlapping memory area(s): {:#010x}..{:#010x} and {:#010x}..{:#010x}",
                    addr_compare,
                    new_end - 1,
                    a.addr_compare,
                    a_end - 1
                ));
            }
        }

        self.areas.push(MemArea {
            addr_mask,
            addr_compare,
            size: rounded,
            size_mask,
            delayr: 1,
            delayw: 1,
            log: None,
            valid: true,
            ops,
        });
        let idx = self.areas.len() - 1;
        if mc {
            self.mc_area = Some(idx);
        }
        self.cur_area = Some(idx);
        Ok(idx)
    }

    pub fn adjust_rw_delay(&mut self, idx: usize, delayr: i64, delayw: i64) {
        self.areas[idx].delayr = delayr;
        self.areas[idx].delayw = delayw;
    }

    pub fn set_log(&mut self, idx: usize, path: &str) {
        match File::create(path) {
            Ok(f) => self.areas[idx].log = Some(f),
            Err(e) => warn!("unable to open {path} to log memory accesses to: {e}"),
        }
    }

    pub fn set_mem_valid(&mut self, idx: usize, valid: bool) {
        self.areas[idx].valid = valid;
    }

    pub fn area(&self, idx: usize) -> &MemArea {
        &self.areas[idx]
    }

    pub fn areas(&self) -> impl Iterator<Item = &MemArea> {
        self.areas.iter()
    }

    /// Find the area containing `addr`: memory controller first, then the
    /// last area used, then a linear scan.
    pub fn verify(&mut self, addr: u32) -> Option<usize> {
        if let Some(mc) = self.mc_area {
            if self.areas[mc].contains(addr) {
                self.cur_area = Some(mc);
                return Some(mc);
            }
        }
        if let Some(cur) = self.cur_area {
            if self.areas[cur].contains(addr) && self.areas[cur].valid {
                return Some(cur);
            }
        }
        for (idx, a) in self.areas.iter().enumerate() {
            if a.contains(addr) && a.valid {
                self.cur_area = Some(idx);
                return Some(idx);
            }
        }
        self.cur_area = None;
        None
    }

    fn log_access(area: &mut MemArea, pa: u32, write: bool, value: u32) {
        if let Some(log) = area.log.as_mut() {
            let dir = if write { "write" } else { "read" };
            let _ = writeln!(log, "[{pa:08x}] -> {dir} {value:08x}");
        }
    }

    /// CPU-visible read. Adds the area's read delay to the cycle accumulator
    /// and raises a bus error tagged with the *virtual* address when the
    /// physical address is unmapped.
    pub fn read<const N: usize>(
        &mut self,
        pa: u32,
        va: u32,
        mem_cycles: &mut i64,
    ) -> Result<u32, Except> {
        const { assert!(N == 8 || N == 16 || N == 32) }
        let Some(idx) = self.verify(pa) else {
            if self.report_errs {
                error!("EXCEPTION: read out of memory ({N}-bit access to {pa:#010x})");
            }
            return Err(Except::BusErr(va));
        };
        let area = &mut self.areas[idx];
        *mem_cycles += area.delayr;
        let off = pa & area.size_mask;
        let value = match N {
            8 => area.ops.read8(off) as u32,
            16 => area.ops.read16(off) as u32,
            _ => area.ops.read32(off),
        };
        Self::log_access(area, pa, false, value);
        Ok(value)
    }

    /// CPU-visible write; write to a read-only area is a bus error.
    pub fn write<const N: usize>(
        &mut self,
        pa: u32,
        va: u32,
        value: u32,
        mem_cycles: &mut i64,
    ) -> Result<(), Except> {
        const { assert!(N == 8 || N == 16 || N == 32) }
        let Some(idx) = self.verify(pa) else {
            if self.report_errs {
                error!("EXCEPTION: write out of memory ({N}-bit access to {pa:#010x})");
            }
            return Err(Except::BusErr(va));
        };
        let area = &mut self.areas[idx];
        *mem_cycles += area.delayw;
        if !area.ops.writeable() {
            return Err(Except::BusErr(va));
        }
        let off = pa & area.size_mask;
        match N {
            8 => area.ops.write8(off, value as u8),
            16 => area.ops.write16(off, value as u16),
            _ => area.ops.write32(off, value),
        }
        Self::log_access(area, pa, true, value);
        Ok(())
    }

    /// Debugger/loader read: never raises, logs and returns zero on a bad
    /// address.
    pub fn read_direct<const N: usize>(&mut self, pa: u32) -> u32 {
        const { assert!(N == 8 || N == 16 || N == 32) }
        let Some(idx) = self.verify(pa) else {
            error!("{N}-bit direct read out of memory area: {pa:#010x}");
            return 0;
        };
        let area = &mut self.areas[idx];
        let off = pa & area.size_mask;
        match N {
            8 => area.ops.read8(off) as u32,
            16 => area.ops.read16(off) as u32,
            _ => area.ops.read32(off),
        }
    }

    /// Program-write back door: ignores writeability, used by the loader and
    /// the RSP memory writes.
    pub fn write_prog<const N: usize>(&mut self, pa: u32, value: u32) {
        const { assert!(N == 8 || N == 32) }
        let Some(idx) = self.verify(pa) else {
            error!("{N}-bit program write out of memory area: {pa:#010x}");
            return;
        };
        let area = &mut self.areas[idx];
        let off = pa & area.size_mask;
        match N {
            8 => area.ops.write8(off, value as u8),
            _ => area.ops.write32(off, value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_with_ram(base: u32, size: u32) -> MemoryMap {
        let mut map = MemoryMap::new();
        map.reg_mem_area(base, size, false, Box::new(Ram::new(size as usize, false)))
            .unwrap();
        map
    }

    #[test]
    fn round_trips_big_endian() {
        let mut map = map_with_ram(0, 0x4000);
        let mut cyc = 0;
        map.write::<32>(0x100, 0x100, 0xdead_beef, &mut cyc).unwrap();
        assert_eq!(map.read::<32>(0x100, 0x100, &mut cyc).unwrap(), 0xdead_beef);
        assert_eq!(map.read::<8>(0x100, 0x100, &mut cyc).unwrap(), 0xde);
        assert_eq!(map.read::<16>(0x102, 0x102, &mut cyc).unwrap(), 0xbeef);
    }

    #[test]
    fn unmapped_access_is_a_bus_error_with_virtual_address() {
        let mut map = map_with_ram(0, 0x4000);
        let mut cyc = 0;
        assert_eq!(
            map.read::<32>(0x8000_0000, 0xc000_1234, &mut cyc),
            Err(Except::BusErr(0xc000_1234))
        );
    }

    #[test]
    fn overlapping_areas_are_rejected() {
        let mut map = map_with_ram(0, 0x4000);
        let err = map.reg_mem_area(0x2000, 0x1000, false, Box::new(Ram::new(0x1000, false)));
        assert!(err.is_err());
    }

    #[test]
    fn area_size_rounds_up_to_power_of_two() {
        let mut map = MemoryMap::new();
        let idx = map
            .reg_mem_area(0x10000, 0x300, false, Box::new(Ram::new(0x400, false)))
            .unwrap();
        assert_eq!(map.area(idx).size(), 0x400);
        assert!(map.verify(0x103fc).is_some());
        assert!(map.verify(0x10400).is_none());
    }

    #[test]
    fn read_delay_accumulates() {
        let mut map = map_with_ram(0, 0x1000);
        map.adjust_rw_delay(0, 5, 2);
        let mut cyc = 0;
        map.read::<32>(0, 0, &mut cyc).unwrap();
        map.write::<32>(0, 0, 1, &mut cyc).unwrap();
        assert_eq!(cyc, 7);
    }

    #[test]
    fn readonly_area_faults_on_cpu_write_but_not_program_write() {
        let mut map = MemoryMap::new();
        map.reg_mem_area(0, 0x1000, false, Box::new(Ram::new(0x1000, true)))
            .unwrap();
        let mut cyc = 0;
        assert!(map.write::<32>(0x10, 0x10, 1, &mut cyc).is_err());
        map.write_prog::<32>(0x10, 0x1234_5678);
        assert_eq!(map.read::<32>(0x10, 0x10, &mut cyc).unwrap(), 0x1234_5678);
    }

    #[test]
    fn invalidated_area_disappears_from_the_map() {
        let mut map = map_with_ram(0, 0x1000);
        let mut cyc = 0;
        map.set_mem_valid(0, false);
        assert!(map.read::<32>(0, 0, &mut cyc).is_err());
        map.set_mem_valid(0, true);
        assert!(map.read::<32>(0, 0, &mut cyc).is_ok());
    }
}
