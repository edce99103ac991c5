use tracing::{info, warn};

use crate::core::emu::Simulator;
use crate::core::except::Except;
use crate::core::sched::JobKind;
use crate::core::spr::*;

impl Simulator {
    pub fn pic_reset(&mut self) {
        if self.config.sim.verbose {
            info!("Resetting PIC");
        }
        self.cpu.sprs.set(SPR_PICMR, 0);
        self.cpu.sprs.set(SPR_PICPR, 0);
        self.cpu.sprs.set(SPR_PICSR, 0);
        self.cpu.pic_lines = 0;
    }

    /// Assert an interrupt line. Safe to call from a memory access callback:
    /// delivery is posted as a zero-delay job and happens at the next
    /// instruction boundary, never in the middle of an access.
    pub fn report_interrupt(&mut self, line: u32) {
        let lmask = 1u32 << line;

        // Any interrupt wakes the core from doze/sleep.
        self.cpu.sprs.clear_bits(SPR_PMR, SPR_PMR_DME | SPR_PMR_SME);

        // Without a PIC the line goes straight to the exception unit.
        if !self.config.pic.enabled {
            if self.cpu.sprs.test(SPR_SR, SPR_SR_IEE) {
                self.except_handle(Except::Interrupt);
            }
            return;
        }

        if self.cpu.pic_lines & lmask != 0 {
            warn!("int line {line} did not change state");
            return;
        }

        self.cpu.pic_lines |= lmask;
        self.cpu.sprs.set_bits(SPR_PICSR, lmask);

        // Lines 0 and 1 bypass the mask only when NMI support is
        // configured; otherwise they are masked like any other line.
        if self.cpu.sprs.test(SPR_PICMR, lmask) || (self.config.pic.use_nmi && line < 2) {
            if self.cpu.sprs.test(SPR_SR, SPR_SR_IEE) {
                self.sched.add(JobKind::PicDeliver, 0);
            }
        }
    }

    /// Deassert an interrupt line. In level-triggered mode the status bit
    /// follows the line.
    pub fn clear_interrupt(&mut self, line: u32) {
        self.cpu.pic_lines &= !(1 << line);
        if !self.config.pic.edge_trigger {
            self.cpu.sprs.clear_bits(SPR_PICSR, 1 << line);
        }
    }

    /// Called when interrupts become enabled (SR[IEE] or PICMR written):
    /// anything already pending and unmasked is delivered at the next
    /// boundary.
    pub fn pic_ints_en(&mut self) {
        if self.cpu.sprs.get(SPR_PICMR) & self.cpu.sprs.get(SPR_PICSR) != 0 {
            self.sched.add(JobKind::PicDeliver, 0);
        }
    }

    /// Scheduler job: deliver the external interrupt if still pending.
    pub fn pic_deliver_job(&mut self) {
        if self.cpu.sprs.get(SPR_PICSR) != 0 {
            self.except_handle(Except::Interrupt);
            self.except_commit_at_boundary();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::core::emu::Simulator;
    use crate::core::sched::JobKind;
    use crate::core::spr::*;

    #[test]
    fn masked_low_lines_stay_masked_without_nmi_support() {
        let mut sim = Simulator::for_test();
        sim.cpu.sprs.set_bits(SPR_SR, SPR_SR_IEE);

        // PICMR clear and no NMI support: line 0 latches status but must
        // not schedule delivery
        sim.report_interrupt(0);
        assert!(sim.sched.time_of(JobKind::PicDeliver).is_none());
        assert!(sim.cpu.sprs.test(SPR_PICSR, 1 << 0));

        // with NMI support the same class of line bypasses the mask
        sim.config.pic.use_nmi = true;
        sim.report_interrupt(1);
        assert!(sim.sched.time_of(JobKind::PicDeliver).is_some());
    }

    #[test]
    fn masked_high_lines_never_bypass() {
        let mut sim = Simulator::for_test();
        sim.cpu.sprs.set_bits(SPR_SR, SPR_SR_IEE);
        sim.config.pic.use_nmi = true;
        // NMI support covers lines 0 and 1 only
        sim.report_interrupt(5);
        assert!(sim.sched.time_of(JobKind::PicDeliver).is_none());
        // unmasking the line delivers what is already pending
        sim.mtspr(SPR_PICMR, 1 << 5);
        assert!(sim.sched.time_of(JobKind::PicDeliver).is_some());
    }
}
