use tracing::warn;

use crate::core::emu::Simulator;
use crate::core::spr::*;

/// Architectural exception classes, in vector order. Classes raised by a
/// memory access carry the effective address that goes to EEAR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Except {
    Reset,
    BusErr(u32),
    DPageFault(u32),
    IPageFault(u32),
    Tick,
    Align(u32),
    Illegal(u32),
    Interrupt,
    DTlbMiss(u32),
    ITlbMiss(u32),
    Range,
    Syscall,
    FloatingPoint,
    Trap,
}

impl Except {
    /// Vector offset from the exception prefix (0x0 or 0xf000_0000).
    pub fn vector(self) -> u32 {
        use Except::*;
        match self {
            Reset => 0x100,
            BusErr(_) => 0x200,
            DPageFault(_) => 0x300,
            IPageFault(_) => 0x400,
            Tick => 0x500,
            Align(_) => 0x600,
            Illegal(_) => 0x700,
            Interrupt => 0x800,
            DTlbMiss(_) => 0x900,
            ITlbMiss(_) => 0xa00,
            Range => 0xb00,
            Syscall => 0xc00,
            FloatingPoint => 0xd00,
            Trap => 0xe00,
        }
    }

    /// Effective address saved to EEAR, if this class carries one.
    pub fn eear(self) -> Option<u32> {
        use Except::*;
        match self {
            BusErr(ea) | DPageFault(ea) | IPageFault(ea) | Align(ea) | Illegal(ea)
            | DTlbMiss(ea) | ITlbMiss(ea) => Some(ea),
            _ => None,
        }
    }

    /// Matching bit in DSR/DRR.
    pub fn dsr_mask(self) -> u32 {
        use Except::*;
        match self {
            Reset => SPR_DSR_RSTE,
            BusErr(_) => SPR_DSR_BUSEE,
            DPageFault(_) => SPR_DSR_DPFE,
            IPageFault(_) => SPR_DSR_IPFE,
            Tick => SPR_DSR_TTE,
            Align(_) => SPR_DSR_AE,
            Illegal(_) => SPR_DSR_IIE,
            Interrupt => SPR_DSR_IE,
            DTlbMiss(_) => SPR_DSR_DME,
            ITlbMiss(_) => SPR_DSR_IME,
            Range => SPR_DSR_RE,
            Syscall => SPR_DSR_SCE,
            FloatingPoint => SPR_DSR_FPE,
            Trap => SPR_DSR_TE,
        }
    }

    pub fn name(self) -> &'static str {
        use Except::*;
        match self {
            Reset => "RESET",
            BusErr(_) => "BUSERR",
            DPageFault(_) => "DPF",
            IPageFault(_) => "IPF",
            Tick => "TICK",
            Align(_) => "ALIGN",
            Illegal(_) => "ILLEGAL",
            Interrupt => "INT",
            DTlbMiss(_) => "DTLBMISS",
            ITlbMiss(_) => "ITLBMISS",
            Range => "RANGE",
            Syscall => "SYSCALL",
            FloatingPoint => "FPE",
            Trap => "TRAP",
        }
    }
}

impl Simulator {
    /// Take an exception: snapshot SR and the faulting PC, mask the enables,
    /// redirect to the vector. If the debug unit claims this class instead,
    /// the processor stalls and nothing architectural happens.
    pub fn except_handle(&mut self, ex: Except) {
        if self.debug_ignore_exception(ex) {
            return;
        }

        if self.cpu.except_pending {
            warn!(
                "exception {} raised while another is pending: overwriting",
                ex.name()
            );
        }
        self.cpu.except_pending = true;

        let eph = self.cpu.sprs.test(SPR_SR, SPR_SR_EPH);
        let vector = ex.vector() + if eph { 0xf000_0000 } else { 0 };
        self.cpu.pcnext = vector;

        if let Some(ea) = ex.eear() {
            self.cpu.sprs.set(SPR_EEAR_BASE, ea);
        }
        self.cpu.sprs.set(SPR_ESR_BASE, self.cpu.sprs.get(SPR_SR));

        // A delay-slot fault resumes at the branch, one word back.
        let slot_adjust = if self.cpu.delay_insn { 4 } else { 0 };
        match ex {
            Except::Reset => (),
            Except::ITlbMiss(ea) | Except::IPageFault(ea) => {
                self.cpu
                    .sprs
                    .set(SPR_EPCR_BASE, ea.wrapping_sub(slot_adjust));
            }
            Except::Syscall => {
                self.cpu.sprs.set(
                    SPR_EPCR_BASE,
                    self.cpu.pc.wrapping_add(4).wrapping_sub(slot_adjust),
                );
            }
            _ => {
                self.cpu
                    .sprs
                    .set(SPR_EPCR_BASE, self.cpu.pc.wrapping_sub(slot_adjust));
            }
        }

        // Translation, overflow traps, interrupts and the timer are all
        // masked on entry; the handler runs in supervisor mode.
        self.cpu.sprs.clear_bits(
            SPR_SR,
            SPR_SR_DME | SPR_SR_IME | SPR_SR_OVE | SPR_SR_IEE | SPR_SR_TEE,
        );
        self.cpu.sprs.set_bits(SPR_SR, SPR_SR_SM);

        self.cpu.delay_insn = false;
    }

    /// Commit an exception raised between instructions (tick, interrupt
    /// delivery): we are already at a boundary, so the redirect happens now
    /// rather than through the next update_pc.
    pub fn except_commit_at_boundary(&mut self) {
        if self.cpu.except_pending {
            self.cpu.pc = self.cpu.pcnext;
            self.cpu.pcnext = self.cpu.pc.wrapping_add(4);
            self.cpu.delay_insn = false;
            self.cpu.next_delay_insn = false;
            self.cpu.except_pending = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vectors_are_spaced_by_0x100() {
        let all = [
            Except::Reset,
            Except::BusErr(0),
            Except::DPageFault(0),
            Except::IPageFault(0),
            Except::Tick,
            Except::Align(0),
            Except::Illegal(0),
            Except::Interrupt,
            Except::DTlbMiss(0),
            Except::ITlbMiss(0),
            Except::Range,
            Except::Syscall,
            Except::FloatingPoint,
            Except::Trap,
        ];
        for (i, ex) in all.iter().enumerate() {
            assert_eq!(ex.vector(), 0x100 * (i as u32 + 1));
            assert_eq!(ex.dsr_mask(), 1 << i);
        }
    }
}
