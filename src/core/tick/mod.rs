//! Tick timer. TTCR is not counted per cycle: it is derived from the global
//! cycle counter and the cycle count at which the timer last (re)started,
//! with scheduler jobs posted for the next compare match.

use tracing::info;

use crate::core::emu::Simulator;
use crate::core::except::Except;
use crate::core::sched::JobKind;
use crate::core::spr::*;

pub struct Tick {
    /// Cycle counter value when the timer started counting.
    pub start_cycle: i64,
    /// One-shot mode freezes the counter; restarts and writes re-arm it.
    pub counting: bool,
}

impl Tick {
    pub fn new() -> Self {
        Tick {
            start_cycle: 0,
            counting: false,
        }
    }
}

impl Simulator {
    pub fn tick_reset(&mut self) {
        if self.config.sim.verbose {
            info!("Resetting tick timer");
        }
        self.cpu.sprs.set(SPR_TTCR, 0);
        self.cpu.sprs.set(SPR_TTMR, 0);
        self.tick.counting = false;
    }

    pub fn spr_read_ttcr(&self) -> u32 {
        if !self.tick.counting {
            self.cpu.sprs.get(SPR_TTCR)
        } else {
            (self.runtime.cycles - self.tick.start_cycle) as u32
        }
    }

    pub fn spr_write_ttcr(&mut self, value: u32) {
        self.tick.start_cycle = self.runtime.cycles - value as i64;
        let ttmr = self.cpu.sprs.get(SPR_TTMR);
        self.sched_timer_job(ttmr);
    }

    /// `prev` is the TTMR value before the store already applied by mtspr.
    pub fn spr_write_ttmr(&mut self, prev: u32) {
        let value = self.cpu.sprs.get(SPR_TTMR);

        // Software cannot set the interrupt-pending bit.
        self.cpu.sprs.clear_bits(SPR_TTMR, SPR_TTMR_IP);

        // A frozen timer must not have TTCR rewritten under it.
        if self.tick.counting {
            self.cpu.sprs.set(
                SPR_TTCR,
                (self.runtime.cycles - self.tick.start_cycle) as u32,
            );
        }
        self.tick.start_cycle = self.runtime.cycles - self.cpu.sprs.get(SPR_TTCR) as i64;

        self.tick.counting = value & SPR_TTMR_M != 0;

        // Continuous mode with TTCR already at the compare value freezes.
        if (value & SPR_TTMR_M) == SPR_TTMR_CR
            && self.cpu.sprs.get(SPR_TTCR) == (value & SPR_TTMR_TP)
        {
            self.tick.counting = false;
        }

        self.sched_timer_job(prev);
    }

    /// (Re)post the scheduler jobs that model the next compare match.
    fn sched_timer_job(&mut self, prev_ttmr: u32) {
        let ttmr = self.cpu.sprs.get(SPR_TTMR);
        let match_ttmr = ttmr & SPR_TTMR_TP;
        let match_ttcr = self.spr_read_ttcr() & SPR_TTMR_TP;

        if (prev_ttmr & SPR_TTMR_IE) != 0 && (ttmr & SPR_TTMR_IP) == 0 {
            self.sched.find_remove(JobKind::TickRaise);
        }

        match prev_ttmr & SPR_TTMR_M {
            SPR_TTMR_RT => self.sched.find_remove(JobKind::TickRestart),
            SPR_TTMR_SR => self.sched.find_remove(JobKind::TickOneShot),
            _ => (),
        }

        let cycles_until_except = if match_ttmr >= match_ttcr {
            (match_ttmr - match_ttcr) as i64
        } else {
            // the comparing slice of TTCR wraps at 28 bits
            (match_ttmr + (0x0fff_ffff - match_ttcr) + 1) as i64
        };

        let arm_raise = (ttmr & SPR_TTMR_IE) != 0 && (ttmr & SPR_TTMR_IP) == 0;
        match ttmr & SPR_TTMR_M {
            0 => {
                if cycles_until_except == 0 && arm_raise {
                    self.sched.add(JobKind::TickRaise, 0);
                }
            }
            SPR_TTMR_RT => {
                self.sched.add(JobKind::TickRestart, cycles_until_except);
                if arm_raise {
                    self.sched.add(JobKind::TickRaise, cycles_until_except);
                }
            }
            SPR_TTMR_SR => {
                if self.tick.counting {
                    self.sched.add(JobKind::TickOneShot, cycles_until_except);
                    if arm_raise {
                        self.sched.add(JobKind::TickRaise, cycles_until_except);
                    }
                }
            }
            _ => {
                // continuous: the compare value only raises interrupts
                if arm_raise {
                    self.sched.add(JobKind::TickRaise, cycles_until_except);
                }
            }
        }
    }

    /// Scheduler job: the counter wrapped to the compare value in restart
    /// mode. A zero compare value fires once per cycle, never twice within
    /// one boundary.
    pub fn tick_restart_job(&mut self) {
        self.cpu.sprs.set(SPR_TTCR, 0);
        self.tick.start_cycle = self.runtime.cycles;
        let period = (self.cpu.sprs.get(SPR_TTMR) & SPR_TTMR_TP) as i64;
        self.sched.add(JobKind::TickRestart, period.max(1));
    }

    /// Scheduler job: one-shot match freezes the counter at the compare
    /// value.
    pub fn tick_one_shot_job(&mut self) {
        let stop = self.cpu.sprs.get(SPR_TTMR) & SPR_TTMR_TP;
        self.cpu.sprs.set(SPR_TTCR, stop);
        self.tick.counting = false;
    }

    /// Scheduler job: assert the interrupt. Re-posts itself each instruction
    /// until software clears TTMR[IP].
    pub fn tick_raise_job(&mut self) {
        self.cpu.sprs.set_bits(SPR_TTMR, SPR_TTMR_IP);
        self.sched_next_insn(JobKind::TickRaise);
        if self.cpu.sprs.test(SPR_SR, SPR_SR_TEE) {
            self.except_handle(Except::Tick);
            self.except_commit_at_boundary();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::core::emu::Simulator;
    use crate::core::sched::JobKind;
    use crate::core::spr::*;

    fn nops(sim: &mut Simulator, n: usize) {
        for i in 0..n {
            sim.mem.write_prog::<32>(0x100 + 4 * i as u32, 0x1500_0000);
        }
    }

    #[test]
    fn restart_mode_with_zero_compare_fires_once_per_cycle() {
        let mut sim = Simulator::for_test();
        nops(&mut sim, 8);
        sim.cpu.sprs.set_bits(SPR_SR, SPR_SR_TEE);
        sim.mtspr(SPR_TTMR, SPR_TTMR_RT | SPR_TTMR_IE);

        let mut entries = 0;
        for _ in 0..5 {
            sim.step();
            if sim.cpu.pc == 0x500 {
                entries += 1;
                // pretend the handler returned and re-enabled the timer
                sim.cpu.sprs.set_bits(SPR_SR, SPR_SR_TEE);
                sim.mtspr(SPR_TTMR, SPR_TTMR_RT | SPR_TTMR_IE);
                sim.set_npc(0x100);
            }
        }
        assert!(entries >= 4, "expected one delivery per cycle, got {entries}");
    }

    #[test]
    fn one_shot_mode_freezes_at_the_compare_value() {
        let mut sim = Simulator::for_test();
        nops(&mut sim, 64);
        sim.mtspr(SPR_TTMR, SPR_TTMR_SR | 10);
        for _ in 0..20 {
            sim.step();
        }
        assert_eq!(sim.spr_read_ttcr(), 10);
        assert!(!sim.tick.counting);
        // frozen: more cycles do not move it
        for _ in 0..5 {
            sim.step();
        }
        assert_eq!(sim.spr_read_ttcr(), 10);
    }

    #[test]
    fn ttcr_tracks_the_cycle_counter_while_counting() {
        let mut sim = Simulator::for_test();
        nops(&mut sim, 64);
        sim.mtspr(SPR_TTMR, SPR_TTMR_CR | 100); // continuous, no interrupt
        let t0 = sim.spr_read_ttcr();
        for _ in 0..7 {
            sim.step();
        }
        assert_eq!(sim.spr_read_ttcr() - t0, 7);
    }

    #[test]
    fn clearing_ie_removes_the_pending_raise_job() {
        let mut sim = Simulator::for_test();
        nops(&mut sim, 8);
        sim.mtspr(SPR_TTMR, SPR_TTMR_RT | SPR_TTMR_IE | 50);
        assert!(sim.sched.time_of(JobKind::TickRaise).is_some());
        sim.mtspr(SPR_TTMR, SPR_TTMR_RT | 50);
        assert!(sim.sched.time_of(JobKind::TickRaise).is_none());
    }
}
