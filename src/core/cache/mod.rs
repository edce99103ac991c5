use tracing::warn;

use crate::core::except::Except;
use crate::core::memory::MemoryMap;

pub const MAX_WAYS: usize = 32;
pub const MAX_SETS: usize = 1024;

/// Tag value marking an empty way.
const TAG_INVALID: u32 = 0xffff_ffff;

#[derive(Clone)]
struct CacheWay {
    tag: u32,
    lru: u32,
    line: Vec<u32>,
}

/// Physically indexed, physically tagged, N-way set associative cache with
/// LRU usage counters. One instance models the I-cache, one the D-cache;
/// they differ only in their delays and in who calls them.
pub struct Cache {
    pub name: &'static str,
    /// Component is present (UPR bit); the SR enable bit is checked by the
    /// caller each access.
    pub enabled: bool,
    pub nways: usize,
    pub nsets: usize,
    pub blocksize: usize,
    pub ustates: u32,
    pub load_hitdelay: i64,
    pub load_missdelay: i64,
    pub store_hitdelay: i64,
    pub store_missdelay: i64,
    sets: Vec<Vec<CacheWay>>,
}

impl Cache {
    pub fn new(name: &'static str) -> Self {
        let mut cache = Cache {
            name,
            enabled: false,
            nways: 1,
            nsets: 512,
            blocksize: 16,
            ustates: 2,
            load_hitdelay: 2,
            load_missdelay: 100,
            store_hitdelay: 0,
            store_missdelay: 0,
            sets: Vec::new(),
        };
        cache.rebuild();
        cache
    }

    /// Validate one dimension the way the configuration layer does: ignore a
    /// bad value with a warning and keep the old one.
    pub fn set_nsets(&mut self, n: usize) {
        if n.is_power_of_two() && n <= MAX_SETS {
            self.nsets = n;
            self.rebuild();
        } else {
            warn!("{} nsets not a power of 2 <= {MAX_SETS}: ignored", self.name);
        }
    }

    pub fn set_nways(&mut self, n: usize) {
        if n.is_power_of_two() && n <= MAX_WAYS {
            self.nways = n;
            self.rebuild();
        } else {
            warn!("{} nways not a power of 2 <= {MAX_WAYS}: ignored", self.name);
        }
    }

    pub fn set_blocksize(&mut self, n: usize) {
        if n == 16 || n == 32 {
            self.blocksize = n;
            self.rebuild();
        } else {
            warn!("{} blocksize must be 16 or 32: ignored", self.name);
        }
    }

    pub fn set_ustates(&mut self, n: u32) {
        if (2..=4).contains(&n) {
            self.ustates = n;
        } else {
            warn!("{} number of usage states must be 2, 3 or 4: ignored", self.name);
        }
    }

    fn rebuild(&mut self) {
        self.sets = vec![
            vec![
                CacheWay {
                    tag: TAG_INVALID,
                    lru: 0,
                    line: vec![0; self.blocksize / 4],
                };
                self.nways
            ];
            self.nsets
        ];
    }

    pub fn reset(&mut self) {
        for set in self.sets.iter_mut() {
            for way in set.iter_mut() {
                way.tag = TAG_INVALID;
                way.lru = 0;
            }
        }
    }

    #[inline(always)]
    fn set_of(&self, addr: u32) -> usize {
        (addr as usize / self.blocksize) % self.nsets
    }

    #[inline(always)]
    fn tag_of(&self, addr: u32) -> u32 {
        (addr as usize / self.blocksize / self.nsets) as u32
    }

    fn find_way(&self, set: usize, tag: u32) -> Option<usize> {
        self.sets[set].iter().position(|w| w.tag == tag)
    }

    fn touch(&mut self, set: usize, way: usize) {
        let hit_lru = self.sets[set][way].lru;
        for w in self.sets[set].iter_mut() {
            if w.lru > hit_lru {
                w.lru -= 1;
            }
        }
        self.sets[set][way].lru = self.ustates - 1;
    }

    fn victim(&self, set: usize) -> usize {
        let mut minway = 0;
        let mut minlru = self.ustates - 1;
        for (i, w) in self.sets[set].iter().enumerate() {
            if w.lru < minlru {
                minway = i;
                minlru = w.lru;
            }
        }
        minway
    }

    fn promote_refilled(&mut self, set: usize, way: usize) {
        for w in self.sets[set].iter_mut() {
            if w.lru != 0 {
                w.lru -= 1;
            }
        }
        self.sets[set][way].lru = self.ustates - 1;
    }

    fn extract(&self, set: usize, way: usize, addr: u32, width: usize) -> u32 {
        let word = self.sets[set][way].line[(addr as usize & (self.blocksize - 1)) >> 2];
        match width {
            4 => word,
            2 => (word >> (if addr & 2 != 0 { 0 } else { 16 })) & 0xffff,
            _ => (word >> (8 * (3 - (addr & 3)))) & 0xff,
        }
    }

    fn merge(&mut self, set: usize, way: usize, addr: u32, data: u32, width: usize) {
        let idx = (addr as usize & (self.blocksize - 1)) >> 2;
        let mut word = self.sets[set][way].line[idx];
        match width {
            4 => word = data,
            2 => {
                let sh = if addr & 2 != 0 { 0 } else { 16 };
                word &= !(0xffff << sh);
                word |= (data & 0xffff) << sh;
            }
            _ => {
                let sh = 8 * (3 - (addr & 3));
                word &= !(0xff << sh);
                word |= (data & 0xff) << sh;
            }
        }
        self.sets[set][way].line[idx] = word;
    }

    /// Refill a whole line around `addr` from memory, starting at the
    /// requested word. A refill touching an unregistered area invalidates
    /// the way and makes the whole access return zero, without raising.
    fn refill(
        &mut self,
        map: &mut MemoryMap,
        set: usize,
        way: usize,
        addr: u32,
    ) -> Result<(), ()> {
        let block_mask = (self.blocksize - 1) as u32;
        let block_base = addr & !block_mask;
        let mut scratch = 0i64; // refill timing is charged as the miss delay
        for i in (0..self.blocksize as u32).step_by(4) {
            let word_addr = block_base + (((addr & !3) + i) & block_mask);
            match map.read::<32>(word_addr, word_addr, &mut scratch) {
                Ok(word) => {
                    let idx = ((word_addr & block_mask) >> 2) as usize;
                    self.sets[set][way].line[idx] = word;
                }
                Err(_) => {
                    self.sets[set][way].tag = TAG_INVALID;
                    self.sets[set][way].lru = 0;
                    return Err(());
                }
            }
        }
        self.sets[set][way].tag = self.tag_of(addr);
        Ok(())
    }

    /// Read through the cache. `bypass` covers every reason not to use it:
    /// component absent, SR enable bit clear, or the page cache-inhibited.
    pub fn simulate_read(
        &mut self,
        map: &mut MemoryMap,
        pa: u32,
        va: u32,
        width: usize,
        bypass: bool,
        mem_cycles: &mut i64,
    ) -> Result<u32, Except> {
        if bypass {
            return match width {
                4 => map.read::<32>(pa, va, mem_cycles),
                2 => map.read::<16>(pa, va, mem_cycles),
                _ => map.read::<8>(pa, va, mem_cycles),
            };
        }

        let set = self.set_of(pa);
        let tag = self.tag_of(pa);
        if let Some(way) = self.find_way(set, tag) {
            self.touch(set, way);
            *mem_cycles += self.load_hitdelay;
            return Ok(self.extract(set, way, pa, width));
        }

        let way = self.victim(set);
        if self.refill(map, set, way, pa).is_err() {
            return Ok(0);
        }
        self.promote_refilled(set, way);
        *mem_cycles += self.load_missdelay;
        Ok(self.extract(set, way, pa, width))
    }

    /// Write-through: memory is updated first so devices observe the store,
    /// then the line is updated in place (hit) or refilled and merged
    /// (miss).
    pub fn simulate_write(
        &mut self,
        map: &mut MemoryMap,
        pa: u32,
        va: u32,
        data: u32,
        width: usize,
        bypass: bool,
        mem_cycles: &mut i64,
    ) -> Result<(), Except> {
        match width {
            4 => map.write::<32>(pa, va, data, mem_cycles)?,
            2 => map.write::<16>(pa, va, data, mem_cycles)?,
            _ => map.write::<8>(pa, va, data, mem_cycles)?,
        }
        if bypass {
            return Ok(());
        }

        let set = self.set_of(pa);
        let tag = self.tag_of(pa);
        if let Some(way) = self.find_way(set, tag) {
            self.touch(set, way);
            *mem_cycles += self.store_hitdelay;
            self.merge(set, way, pa, data, width);
            return Ok(());
        }

        let way = self.victim(set);
        if self.refill(map, set, way, pa).is_err() {
            return Ok(());
        }
        self.promote_refilled(set, way);
        *mem_cycles += self.store_missdelay;
        self.merge(set, way, pa, data, width);
        Ok(())
    }

    /// Invalidate the line holding `addr`. With the SR enable bit clear the
    /// whole set is flushed instead.
    pub fn inv(&mut self, addr: u32, sr_enabled: bool) {
        if !self.enabled {
            return;
        }
        let set = self.set_of(addr);
        if !sr_enabled {
            for way in self.sets[set].iter_mut() {
                way.tag = TAG_INVALID;
                way.lru = 0;
            }
            return;
        }
        let tag = self.tag_of(addr);
        if let Some(way) = self.find_way(set, tag) {
            self.sets[set][way].tag = TAG_INVALID;
            self.sets[set][way].lru = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory::Ram;

    fn small_map() -> MemoryMap {
        let mut map = MemoryMap::new();
        map.reg_mem_area(0, 0x10000, false, Box::new(Ram::new(0x10000, false)))
            .unwrap();
        map.adjust_rw_delay(0, 0, 0);
        map
    }

    fn small_cache() -> Cache {
        let mut c = Cache::new("dc");
        c.enabled = true;
        c.set_nways(1);
        c.set_nsets(4);
        c.set_blocksize(16);
        c.load_hitdelay = 2;
        c.load_missdelay = 20;
        c
    }

    #[test]
    fn miss_then_hit_then_invalidate_then_miss() {
        let mut map = small_map();
        let mut c = small_cache();
        map.write_prog::<32>(0x1000, 0x11111111);
        map.write_prog::<32>(0x1004, 0x22222222);

        let mut cyc = 0;
        assert_eq!(
            c.simulate_read(&mut map, 0x1000, 0x1000, 4, false, &mut cyc).unwrap(),
            0x11111111
        );
        assert_eq!(cyc, 20); // miss

        cyc = 0;
        assert_eq!(
            c.simulate_read(&mut map, 0x1004, 0x1004, 4, false, &mut cyc).unwrap(),
            0x22222222
        );
        assert_eq!(cyc, 2); // hit in the refilled line

        c.inv(0x1000, true);

        cyc = 0;
        assert_eq!(
            c.simulate_read(&mut map, 0x1004, 0x1004, 4, false, &mut cyc).unwrap(),
            0x22222222
        );
        assert_eq!(cyc, 20); // miss again
    }

    #[test]
    fn direct_mapped_single_line_degenerates_cleanly() {
        let mut map = small_map();
        let mut c = small_cache();
        c.set_nsets(1);
        let mut cyc = 0;
        map.write_prog::<32>(0x0, 0xaaaa_0000);
        map.write_prog::<32>(0x10, 0xbbbb_0000);
        assert_eq!(c.simulate_read(&mut map, 0x0, 0x0, 4, false, &mut cyc).unwrap(), 0xaaaa_0000);
        // conflicting line evicts the only way
        assert_eq!(c.simulate_read(&mut map, 0x10, 0x10, 4, false, &mut cyc).unwrap(), 0xbbbb_0000);
        cyc = 0;
        assert_eq!(c.simulate_read(&mut map, 0x0, 0x0, 4, false, &mut cyc).unwrap(), 0xaaaa_0000);
        assert_eq!(cyc, c.load_missdelay);
    }

    #[test]
    fn write_through_updates_memory_and_line() {
        let mut map = small_map();
        let mut c = small_cache();
        let mut cyc = 0;
        c.simulate_read(&mut map, 0x2000, 0x2000, 4, false, &mut cyc).unwrap();
        c.simulate_write(&mut map, 0x2000, 0x2000, 0xcafe_f00d, 4, false, &mut cyc)
            .unwrap();
        // memory sees the store immediately
        assert_eq!(map.read_direct::<32>(0x2000), 0xcafe_f00d);
        // and the line agrees
        cyc = 0;
        assert_eq!(
            c.simulate_read(&mut map, 0x2000, 0x2000, 4, false, &mut cyc).unwrap(),
            0xcafe_f00d
        );
        assert_eq!(cyc, c.load_hitdelay);
    }

    #[test]
    fn sub_word_extraction_is_big_endian() {
        let mut map = small_map();
        let mut c = small_cache();
        let mut cyc = 0;
        map.write_prog::<32>(0x3000, 0x1122_3344);
        assert_eq!(c.simulate_read(&mut map, 0x3000, 0x3000, 1, false, &mut cyc).unwrap(), 0x11);
        assert_eq!(c.simulate_read(&mut map, 0x3003, 0x3003, 1, false, &mut cyc).unwrap(), 0x44);
        assert_eq!(c.simulate_read(&mut map, 0x3000, 0x3000, 2, false, &mut cyc).unwrap(), 0x1122);
        assert_eq!(c.simulate_read(&mut map, 0x3002, 0x3002, 2, false, &mut cyc).unwrap(), 0x3344);
    }

    #[test]
    fn refill_from_unmapped_memory_invalidates_and_returns_zero() {
        let mut map = small_map();
        let mut c = small_cache();
        let mut cyc = 0;
        assert_eq!(
            c.simulate_read(&mut map, 0x8000_0000, 0x8000_0000, 4, false, &mut cyc),
            Ok(0)
        );
        // nothing cached for that address afterwards
        map.write_prog::<32>(0x1000, 7);
        assert_eq!(c.simulate_read(&mut map, 0x1000, 0x1000, 4, false, &mut cyc).unwrap(), 7);
    }

    #[test]
    fn bad_dimension_is_ignored() {
        let mut c = small_cache();
        c.set_nsets(3);
        assert_eq!(c.nsets, 4);
        c.set_blocksize(64);
        assert_eq!(c.blocksize, 16);
    }
}
