//! Program image loading: big-endian ELF32 and a classic COFF subset.
//!
//! Only allocatable PROGBITS/text/data content is copied in, through the
//! memory map's program-write back door (region writability is ignored).
//! The symbol table feeds the label map.

pub mod labels;

use tracing::{debug, info, warn};

use crate::core::emu::Simulator;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

const SHT_PROGBITS: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHF_ALLOC: u32 = 0x2;

const COFF_STYP_TEXT: u32 = 0x20;
const COFF_STYP_DATA: u32 = 0x40;

fn be16(b: &[u8], off: usize) -> Option<u16> {
    Some(u16::from_be_bytes(b.get(off..off + 2)?.try_into().ok()?))
}

fn be32(b: &[u8], off: usize) -> Option<u32> {
    Some(u32::from_be_bytes(b.get(off..off + 4)?.try_into().ok()?))
}

fn cstr(b: &[u8], off: usize) -> String {
    let mut s = String::new();
    let mut i = off;
    while let Some(&c) = b.get(i) {
        if c == 0 {
            break;
        }
        s.push(c as char);
        i += 1;
    }
    s
}

impl Simulator {
    /// Load the program image; the simulator starts from the reset vector
    /// regardless of the image entry point.
    pub fn load_object(&mut self, path: &str) -> Result<(), String> {
        let image = std::fs::read(path).map_err(|e| format!("cannot open {path}: {e}"))?;
        info!("loading {path} (MD5 {:x})", md5::compute(&image));

        if image.get(0..4) == Some(&ELF_MAGIC) {
            self.load_elf(&image)
        } else {
            self.load_coff(&image)
        }
    }

    fn load_elf(&mut self, image: &[u8]) -> Result<(), String> {
        let bad = || "truncated ELF image".to_string();

        if image.get(4) != Some(&1) {
            return Err("only ELF class 32 is supported".to_string());
        }
        if image.get(5) != Some(&2) {
            return Err("only big-endian ELF is supported".to_string());
        }

        let shoff = be32(image, 32).ok_or_else(bad)? as usize;
        let shentsize = be16(image, 46).ok_or_else(bad)? as usize;
        let shnum = be16(image, 48).ok_or_else(bad)? as usize;

        let sh = |i: usize, field: usize| be32(image, shoff + i * shentsize + field);

        // Pass 1: allocatable PROGBITS sections into memory.
        for i in 0..shnum {
            let sh_type = sh(i, 4).ok_or_else(bad)?;
            let sh_flags = sh(i, 8).ok_or_else(bad)?;
            if sh_type != SHT_PROGBITS || sh_flags & SHF_ALLOC == 0 {
                continue;
            }
            let addr = sh(i, 12).ok_or_else(bad)?;
            let offset = sh(i, 16).ok_or_else(bad)? as usize;
            let size = sh(i, 20).ok_or_else(bad)? as usize;
            let data = image.get(offset..offset + size).ok_or_else(bad)?;
            debug!("section {i}: {size:#x} bytes at {addr:#010x}");
            for (o, &byte) in data.iter().enumerate() {
                self.mem.write_prog::<8>(addr.wrapping_add(o as u32), byte as u32);
            }
        }

        // Pass 2: symbols into the label map.
        for i in 0..shnum {
            let sh_type = sh(i, 4).ok_or_else(bad)?;
            if sh_type != SHT_SYMTAB {
                continue;
            }
            let offset = sh(i, 16).ok_or_else(bad)? as usize;
            let size = sh(i, 20).ok_or_else(bad)? as usize;
            let link = sh(i, 24).ok_or_else(bad)? as usize;
            let entsize = sh(i, 36).ok_or_else(bad)? as usize;
            if entsize == 0 || link >= shnum {
                continue;
            }
            let str_off = sh(link, 16).ok_or_else(bad)? as usize;
            for s in 0..size / entsize {
                let base = offset + s * entsize;
                let name_off = be32(image, base).ok_or_else(bad)? as usize;
                let value = be32(image, base + 4).ok_or_else(bad)?;
                if name_off == 0 {
                    continue;
                }
                let name = cstr(image, str_off + name_off);
                if !name.is_empty() {
                    self.labels.add(value, &name);
                }
            }
        }

        info!("{} symbols loaded", self.labels.len());
        Ok(())
    }

    fn load_coff(&mut self, image: &[u8]) -> Result<(), String> {
        let bad = || "not a recognised ELF or COFF image".to_string();

        let nscns = be16(image, 2).ok_or_else(bad)? as usize;
        let symptr = be32(image, 8).ok_or_else(bad)? as usize;
        let nsyms = be32(image, 12).ok_or_else(bad)? as usize;
        let opthdr = be16(image, 16).ok_or_else(bad)? as usize;
        if nscns == 0 || nscns > 64 {
            return Err(bad());
        }

        let scn_base = 20 + opthdr;
        for i in 0..nscns {
            let base = scn_base + i * 40;
            let vaddr = be32(image, base + 12).ok_or_else(bad)?;
            let size = be32(image, base + 16).ok_or_else(bad)? as usize;
            let scnptr = be32(image, base + 20).ok_or_else(bad)? as usize;
            let flags = be32(image, base + 36).ok_or_else(bad)?;
            if flags & (COFF_STYP_TEXT | COFF_STYP_DATA) == 0 || scnptr == 0 {
                continue;
            }
            let data = image.get(scnptr..scnptr + size).ok_or_else(bad)?;
            debug!("COFF section {i}: {size:#x} bytes at {vaddr:#010x}");
            for (o, &byte) in data.iter().enumerate() {
                self.mem.write_prog::<8>(vaddr.wrapping_add(o as u32), byte as u32);
            }
        }

        // Symbol entries are 18 bytes; names either inline (8 bytes) or in
        // the string table that follows the symbols.
        let strtab = symptr + nsyms * 18;
        let mut i = 0;
        while i < nsyms {
            let base = symptr + i * 18;
            let Some(entry) = image.get(base..base + 18) else {
                warn!("COFF symbol table truncated");
                break;
            };
            let value = u32::from_be_bytes(entry[8..12].try_into().unwrap());
            let numaux = entry[17] as usize;
            let name = if entry[0..4] == [0, 0, 0, 0] {
                let off = u32::from_be_bytes(entry[4..8].try_into().unwrap()) as usize;
                cstr(image, strtab + off)
            } else {
                let end = entry[0..8].iter().position(|&c| c == 0).unwrap_or(8);
                String::from_utf8_lossy(&entry[0..end]).into_owned()
            };
            if !name.is_empty() {
                self.labels.add(value, &name);
            }
            i += 1 + numaux;
        }

        info!("{} symbols loaded", self.labels.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::emu::Simulator;

    /// Assemble a minimal big-endian ELF32 with one ALLOC PROGBITS section
    /// and one symbol.
    fn tiny_elf(text_addr: u32, text: &[u8], sym: (&str, u32)) -> Vec<u8> {
        let mut img = vec![0u8; 52];
        img[0..4].copy_from_slice(&ELF_MAGIC);
        img[4] = 1; // class 32
        img[5] = 2; // big endian

        let text_off = 52;
        let strtab = format!("\0{}\0", sym.0).into_bytes();
        let strtab_off = text_off + text.len();
        let symtab_off = strtab_off + strtab.len();
        let shoff = symtab_off + 16;

        img.extend_from_slice(text);
        img.extend_from_slice(&strtab);
        // one symbol entry
        img.extend_from_slice(&1u32.to_be_bytes()); // st_name
        img.extend_from_slice(&sym.1.to_be_bytes()); // st_value
        img.extend_from_slice(&[0u8; 8]);

        // section headers: null, .text, .strtab, .symtab
        let mut sh = |ty: u32, flags: u32, addr: u32, off: u32, size: u32, link: u32, entsize: u32| {
            img.extend_from_slice(&0u32.to_be_bytes()); // sh_name
            img.extend_from_slice(&ty.to_be_bytes());
            img.extend_from_slice(&flags.to_be_bytes());
            img.extend_from_slice(&addr.to_be_bytes());
            img.extend_from_slice(&off.to_be_bytes());
            img.extend_from_slice(&size.to_be_bytes());
            img.extend_from_slice(&link.to_be_bytes());
            img.extend_from_slice(&0u32.to_be_bytes()); // sh_info
            img.extend_from_slice(&0u32.to_be_bytes()); // sh_addralign
            img.extend_from_slice(&entsize.to_be_bytes());
        };
        sh(0, 0, 0, 0, 0, 0, 0);
        sh(SHT_PROGBITS, SHF_ALLOC, text_addr, text_off as u32, text.len() as u32, 0, 0);
        sh(3, 0, 0, strtab_off as u32, strtab.len() as u32, 0, 0);
        sh(SHT_SYMTAB, 0, 0, symtab_off as u32, 16, 2, 16);

        // patch the header now the layout is known
        img[32..36].copy_from_slice(&(shoff as u32).to_be_bytes());
        img[46..48].copy_from_slice(&40u16.to_be_bytes());
        img[48..50].copy_from_slice(&4u16.to_be_bytes());
        img
    }

    #[test]
    fn loads_sections_and_symbols() {
        let mut sim = Simulator::for_test();
        let elf = tiny_elf(0x100, &[0x15, 0x00, 0x00, 0x01, 0xaa, 0xbb, 0xcc, 0xdd], ("_start", 0x100));
        let path = std::env::temp_dir().join("r_or1k_tiny_elf_test");
        std::fs::write(&path, &elf).unwrap();
        sim.load_object(path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(sim.mem.read_direct::<32>(0x100), 0x1500_0001);
        assert_eq!(sim.mem.read_direct::<32>(0x104), 0xaabb_ccdd);
        assert_eq!(sim.labels.find("_start"), Some(0x100));
    }

    #[test]
    fn rejects_wrong_class() {
        let mut sim = Simulator::for_test();
        let mut elf = tiny_elf(0x100, &[0; 4], ("x", 0));
        elf[4] = 2; // ELF64
        let path = std::env::temp_dir().join("r_or1k_bad_elf_test");
        std::fs::write(&path, &elf).unwrap();
        assert!(sim.load_object(path.to_str().unwrap()).is_err());
        std::fs::remove_file(&path).ok();
    }
}
