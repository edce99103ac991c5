//! Debug unit: matchpoint comparators, the watchpoint chain, and the
//! stall/unstall machinery the RSP server drives.

use tracing::debug;

use crate::core::emu::Simulator;
use crate::core::except::Except;
use crate::core::spr::*;

pub mod rsp;

pub const MAX_MATCHPOINTS: usize = 8;
pub const MAX_WATCHPOINTS: usize = 10;

/// CPU events a matchpoint comparator can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugAction {
    InstructionFetch,
    LoadAddress,
    StoreAddress,
    LoadData,
    StoreData,
}

/// How the two counter-fed watchpoints chain. The architecture manual and
/// the Verilog disagree; the Verilog is taken as authoritative: watchpoint 4
/// chains with 3, watchpoint 8 with 7 and 9 with 8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainPolicy {
    Verilog,
}

pub const CHAIN_POLICY: ChainPolicy = ChainPolicy::Verilog;

/// Host-side debug unit state (everything architectural lives in the SPRs).
pub struct DebugUnit {
    /// Reset in progress: matchpoints must not fire.
    pub in_reset: bool,
}

impl DebugUnit {
    pub fn new() -> Self {
        DebugUnit { in_reset: false }
    }
}

impl Simulator {
    pub fn du_reset(&mut self) {
        self.du.in_reset = false;
        self.set_stall_state(false);
    }

    /// Stall or release the processor. Unstalling revalidates the NPC and
    /// wakes a halted core.
    pub fn set_stall_state(&mut self, stall: bool) {
        self.runtime.stalled = stall;
        if !stall {
            self.cpu.npc_not_valid = false;
            self.runtime.halted = false;
        }
    }

    /// Should the debug unit swallow this exception and stall instead of
    /// vectoring? DSR selects the classes the external debugger owns.
    pub fn debug_ignore_exception(&mut self, ex: Except) -> bool {
        if !self.config.debug.enabled {
            return false;
        }
        let mask = ex.dsr_mask();
        if !self.cpu.sprs.test(SPR_DSR, mask) {
            return false;
        }
        debug!("debug unit claims exception {}", ex.name());
        self.cpu.sprs.set_bits(SPR_DRR, mask);
        self.set_stall_state(true);
        if self.config.debug.rsp_enabled {
            self.rsp_exception(ex);
        }
        true
    }

    /// Test the matchpoint comparators against one CPU event; sets the
    /// per-instruction breakpoint flag when a break-generating watchpoint
    /// fires.
    pub fn check_debug_unit(&mut self, action: DebugAction, udata: u32) {
        if !self.config.debug.enabled || self.du.in_reset {
            return;
        }
        if self
            .cpu
            .sprs
            .test(SPR_DMR2, SPR_DMR2_WGB | SPR_DMR2_AWTC | SPR_DMR2_WCE0 | SPR_DMR2_WCE1)
        {
            if self.calculate_watchpoints(action, udata) {
                self.cpu.breakpoint = true;
            }
        }
    }

    fn matchpoint_matches(&self, i: usize, action: DebugAction, udata: u32) -> bool {
        let dcr = self.cpu.sprs.get(spr_dcr(i as u32));
        if dcr & SPR_DCR_DP == 0 {
            return false;
        }

        let wanted = match dcr & SPR_DCR_CT {
            SPR_DCR_CT_IFEA => action == DebugAction::InstructionFetch,
            SPR_DCR_CT_LEA => action == DebugAction::LoadAddress,
            SPR_DCR_CT_SEA => action == DebugAction::StoreAddress,
            SPR_DCR_CT_LD => action == DebugAction::LoadData,
            SPR_DCR_CT_SD => action == DebugAction::StoreData,
            SPR_DCR_CT_LSEA => {
                action == DebugAction::LoadAddress || action == DebugAction::StoreAddress
            }
            SPR_DCR_CT_LSD => action == DebugAction::LoadData || action == DebugAction::StoreData,
            _ => false,
        };
        if !wanted {
            return false;
        }

        let dvr = self.cpu.sprs.get(spr_dvr(i as u32));
        if dcr & SPR_DCR_SC != 0 {
            let op1 = udata as i32;
            let op2 = dvr as i32;
            match dcr & SPR_DCR_CC {
                SPR_DCR_CC_MASKED => (op1 & op2) != 0,
                SPR_DCR_CC_EQUAL => op1 == op2,
                SPR_DCR_CC_NEQUAL => op1 != op2,
                SPR_DCR_CC_LESS => op1 < op2,
                SPR_DCR_CC_LESSE => op1 <= op2,
                SPR_DCR_CC_GREAT => op1 > op2,
                SPR_DCR_CC_GREATE => op1 >= op2,
                _ => false,
            }
        } else {
            let op1 = udata;
            let op2 = dvr;
            match dcr & SPR_DCR_CC {
                SPR_DCR_CC_MASKED => (op1 & op2) != 0,
                SPR_DCR_CC_EQUAL => op1 == op2,
                SPR_DCR_CC_NEQUAL => op1 != op2,
                SPR_DCR_CC_LESS => op1 < op2,
                SPR_DCR_CC_LESSE => op1 <= op2,
                SPR_DCR_CC_GREAT => op1 > op2,
                SPR_DCR_CC_GREATE => op1 >= op2,
                _ => false,
            }
        }
    }

    /// Evaluate the matchpoints, run them through the AND/OR chain, bump the
    /// two event counters, and report whether a break-generating watchpoint
    /// fired.
    fn calculate_watchpoints(&mut self, action: DebugAction, udata: u32) -> bool {
        let mut mp = [false; MAX_MATCHPOINTS];
        let mut match_found = false;
        for i in 0..MAX_MATCHPOINTS {
            mp[i] = self.matchpoint_matches(i, action, udata);
            match_found |= mp[i];
        }
        if !match_found {
            return false;
        }

        let dmr1 = self.cpu.sprs.get(SPR_DMR1);
        let mut wp = [false; MAX_WATCHPOINTS];

        // Watchpoint 0 has only the external watchpoint to chain with,
        // which is not modelled.
        wp[0] = (dmr1 & spr_dmr1_cw(0)) == 0 && mp[0];
        for i in 1..MAX_MATCHPOINTS {
            let cw = dmr1 & spr_dmr1_cw(i as u32);
            wp[i] = if cw == 0 {
                mp[i]
            } else if cw == spr_dmr1_cw_and(i as u32) {
                mp[i] && wp[i - 1]
            } else if cw == spr_dmr1_cw_or(i as u32) {
                mp[i] || wp[i - 1]
            } else {
                debug!("DMR1 chain value 11 for watchpoint {i} reserved");
                false
            };
        }

        // Counters: each of the first eight watchpoints increments the
        // counter DMR2[AWTC] assigns it to, when that counter is enabled.
        let dmr2 = self.cpu.sprs.get(SPR_DMR2);
        let counter0_enabled = dmr2 & SPR_DMR2_WCE0 != 0;
        let counter1_enabled = dmr2 & SPR_DMR2_WCE1 != 0;
        if counter0_enabled || counter1_enabled {
            let mut counter0 = self.cpu.sprs.get(SPR_DWCR0) & SPR_DWCR_COUNT;
            let mut counter1 = self.cpu.sprs.get(SPR_DWCR1) & SPR_DWCR_COUNT;
            for i in 0..MAX_WATCHPOINTS - 2 {
                let use_counter1 = (dmr2 >> (SPR_DMR2_AWTC_OFF + i as u32)) & 1 == 1;
                if use_counter1 {
                    if counter1_enabled && wp[i] {
                        counter1 = (counter1 + 1) & SPR_DWCR_COUNT;
                    }
                } else if counter0_enabled && wp[i] {
                    counter0 = (counter0 + 1) & SPR_DWCR_COUNT;
                }
            }
            let dwcr0 = (self.cpu.sprs.get(SPR_DWCR0) & !SPR_DWCR_COUNT) | counter0;
            let dwcr1 = (self.cpu.sprs.get(SPR_DWCR1) & !SPR_DWCR_COUNT) | counter1;
            self.cpu.sprs.set(SPR_DWCR0, dwcr0);
            self.cpu.sprs.set(SPR_DWCR1, dwcr1);
        }

        // Watchpoints 8 and 9 fire on counter-equals-match, chained per the
        // Verilog reading (with 7 and 8 respectively).
        let dwcr0 = self.cpu.sprs.get(SPR_DWCR0);
        let dwcr1 = self.cpu.sprs.get(SPR_DWCR1);
        let counter0_matched =
            (dwcr0 & SPR_DWCR_COUNT) == ((dwcr0 & SPR_DWCR_MATCH) >> SPR_DWCR_MATCH_OFF);
        let counter1_matched =
            (dwcr1 & SPR_DWCR_COUNT) == ((dwcr1 & SPR_DWCR_MATCH) >> SPR_DWCR_MATCH_OFF);

        for (i, matched) in [(8usize, counter0_matched), (9, counter1_matched)] {
            let cw = dmr1 & spr_dmr1_cw(i as u32);
            wp[i] = if cw == 0 {
                matched
            } else if cw == spr_dmr1_cw_and(i as u32) {
                matched && wp[i - 1]
            } else if cw == spr_dmr1_cw_or(i as u32) {
                matched || wp[i - 1]
            } else {
                debug!("DMR1 chain value 11 for watchpoint {i} reserved");
                false
            };
        }

        // Finally: does any firing watchpoint generate a breakpoint?
        let wgb = (dmr2 & SPR_DMR2_WGB) >> SPR_DMR2_WGB_OFF;
        (0..MAX_WATCHPOINTS).any(|i| wp[i] && (wgb >> i) & 1 != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::emu::Simulator;

    fn sim() -> Simulator {
        let mut sim = Simulator::for_test();
        sim.config.debug.enabled = true;
        sim
    }

    fn arm_matchpoint(sim: &mut Simulator, n: u32, ct: u32, value: u32) {
        sim.cpu.sprs.set(spr_dvr(n), value);
        sim.cpu.sprs.set(spr_dcr(n), SPR_DCR_DP | SPR_DCR_CC_EQUAL | ct);
    }

    #[test]
    fn fetch_matchpoint_generates_breakpoint() {
        let mut sim = sim();
        arm_matchpoint(&mut sim, 0, SPR_DCR_CT_IFEA, 0x1234_0000);
        sim.cpu.sprs.set(SPR_DMR2, 1 << SPR_DMR2_WGB_OFF);
        sim.check_debug_unit(DebugAction::InstructionFetch, 0x1234_0000);
        assert!(sim.cpu.breakpoint);
        sim.cpu.breakpoint = false;
        sim.check_debug_unit(DebugAction::InstructionFetch, 0x1234_0004);
        assert!(!sim.cpu.breakpoint);
    }

    #[test]
    fn and_chain_requires_both_matchpoints() {
        let mut sim = sim();
        arm_matchpoint(&mut sim, 0, SPR_DCR_CT_LEA, 0x100);
        arm_matchpoint(&mut sim, 1, SPR_DCR_CT_LEA, 0x100);
        sim.cpu.sprs.set(SPR_DMR1, spr_dmr1_cw_and(1));
        sim.cpu.sprs.set(SPR_DMR2, 2 << SPR_DMR2_WGB_OFF);
        sim.check_debug_unit(DebugAction::LoadAddress, 0x100);
        assert!(sim.cpu.breakpoint);

        // break matchpoint 0: wp1 = mp1 && wp0 no longer fires
        sim.cpu.breakpoint = false;
        sim.cpu.sprs.set(spr_dvr(0), 0x200);
        sim.check_debug_unit(DebugAction::LoadAddress, 0x100);
        assert!(!sim.cpu.breakpoint);
    }

    #[test]
    fn signed_comparison_uses_sign() {
        let mut sim = sim();
        sim.cpu.sprs.set(spr_dvr(2), 0);
        sim.cpu
            .sprs
            .set(spr_dcr(2), SPR_DCR_DP | SPR_DCR_SC | SPR_DCR_CC_LESS | SPR_DCR_CT_LD);
        sim.cpu.sprs.set(SPR_DMR2, 4 << SPR_DMR2_WGB_OFF);
        sim.check_debug_unit(DebugAction::LoadData, 0xffff_ffff); // -1 < 0
        assert!(sim.cpu.breakpoint);
        sim.cpu.breakpoint = false;
        sim.check_debug_unit(DebugAction::LoadData, 1);
        assert!(!sim.cpu.breakpoint);
    }

    #[test]
    fn counter_watchpoint_fires_on_match() {
        let mut sim = sim();
        arm_matchpoint(&mut sim, 0, SPR_DCR_CT_LEA, 0x40);
        // counter 0 enabled, assigned wp0, matches at 2; wp8 generates break
        sim.cpu.sprs.set(SPR_DMR2, SPR_DMR2_WCE0 | (1 << (SPR_DMR2_WGB_OFF + 8)));
        sim.cpu.sprs.set(SPR_DWCR0, 2 << SPR_DWCR_MATCH_OFF);
        sim.check_debug_unit(DebugAction::LoadAddress, 0x40);
        assert!(!sim.cpu.breakpoint);
        sim.check_debug_unit(DebugAction::LoadAddress, 0x40);
        assert!(sim.cpu.breakpoint);
        assert_eq!(sim.cpu.sprs.get(SPR_DWCR0) & SPR_DWCR_COUNT, 2);
    }
}
