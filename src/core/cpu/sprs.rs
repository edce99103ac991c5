//! mtspr/mfspr dispatch: the SPR index space with its side effects.

use tracing::{debug, info, warn};

use crate::core::emu::Simulator;
use crate::core::spr::*;

impl Simulator {
    /// Write an SPR, running whatever machinery hangs off that index.
    pub fn mtspr(&mut self, regno: u16, value: u32) {
        let prev = self.cpu.sprs.get(regno);
        self.cpu.sprs.set(regno, value);

        match regno {
            SPR_TTCR => self.spr_write_ttcr(value),
            SPR_TTMR => self.spr_write_ttmr(prev),

            /* data cache block operations */
            SPR_DCBPR => {
                // prefetch: pull the line in, discard the data
                let pa = self.peek_into_dtlb(value, false);
                let bypass = !self.cpu.sprs.test(SPR_UPR, SPR_UPR_DCP)
                    || !self.cpu.sprs.test(SPR_SR, SPR_SR_DCE);
                let mut scratch = 0;
                let _ = self
                    .dc
                    .simulate_read(&mut self.mem, pa, value, 4, bypass, &mut scratch);
                self.cpu.sprs.set(SPR_DCBPR, 0);
            }
            SPR_DCBFR => {
                self.dc_inv(value);
                self.cpu.sprs.set(SPR_DCBFR, u32::MAX);
            }
            SPR_DCBIR => {
                self.dc_inv(value);
                self.cpu.sprs.set(SPR_DCBIR, 0);
            }
            SPR_DCBWR => self.cpu.sprs.set(SPR_DCBWR, 0),
            SPR_DCBLR => self.cpu.sprs.set(SPR_DCBLR, 0),

            /* instruction cache block operations */
            SPR_ICBPR => {
                let pa = self.peek_into_itlb(value);
                let bypass = !self.cpu.sprs.test(SPR_UPR, SPR_UPR_ICP)
                    || !self.cpu.sprs.test(SPR_SR, SPR_SR_ICE);
                let mut scratch = 0;
                let _ = self
                    .ic
                    .simulate_read(&mut self.mem, pa, value, 4, bypass, &mut scratch);
                self.cpu.sprs.set(SPR_ICBPR, 0);
            }
            SPR_ICBIR => {
                self.ic_inv(value);
                self.cpu.sprs.set(SPR_ICBIR, 0);
            }
            SPR_ICBLR => self.cpu.sprs.set(SPR_ICBLR, 0),

            SPR_SR => {
                self.cpu.sprs.set_bits(SPR_SR, SPR_SR_FO);
                if value & SPR_SR_IEE != 0 && prev & SPR_SR_IEE == 0 {
                    self.pic_ints_en();
                }
            }

            SPR_NPC => self.set_npc(value),

            SPR_PICSR => {
                // In level-triggered mode the status register follows the
                // lines, not stores.
                if !self.config.pic.edge_trigger {
                    self.cpu.sprs.set(SPR_PICSR, prev);
                }
            }
            SPR_PICMR => {
                if self.config.pic.use_nmi {
                    self.cpu.sprs.set_bits(SPR_PICMR, 0x0000_0003);
                }
                if self.cpu.sprs.test(SPR_SR, SPR_SR_IEE) {
                    self.pic_ints_en();
                }
            }

            SPR_PMR => {
                if self.config.pm.enabled && value & SPR_PMR_SUME != 0 {
                    info!("SUSPEND: PMR[SUME] bit was set");
                    self.sim_done();
                }
            }

            _ => {
                // TLB match/translate arrays: mask the reserved bits
                if (spr_dtlbmr_base(0)..spr_dtlbtr_base(3) + 0x80).contains(&regno) {
                    let page = value & self.dmmu.page_mask();
                    let masked = if (regno & 0xff) < 0x80 {
                        page | (value & (SPR_TLBMR_V | SPR_TLBMR_PL1 | SPR_TLBMR_CID | SPR_TLBMR_LRU))
                    } else {
                        page | (value
                            & (SPR_TLBTR_CC
                                | SPR_TLBTR_CI
                                | SPR_TLBTR_WBC
                                | SPR_TLBTR_WOM
                                | SPR_TLBTR_A
                                | SPR_TLBTR_D
                                | SPR_DTLBTR_URE
                                | SPR_DTLBTR_UWE
                                | SPR_DTLBTR_SRE
                                | SPR_DTLBTR_SWE))
                    };
                    self.cpu.sprs.set(regno, masked);
                } else if (spr_itlbmr_base(0)..spr_itlbtr_base(3) + 0x80).contains(&regno) {
                    let page = value & self.immu.page_mask();
                    let masked = if (regno & 0xff) < 0x80 {
                        page | (value & (SPR_TLBMR_V | SPR_TLBMR_PL1 | SPR_TLBMR_CID | SPR_TLBMR_LRU))
                    } else {
                        page | (value
                            & (SPR_TLBTR_CC
                                | SPR_TLBTR_CI
                                | SPR_TLBTR_WBC
                                | SPR_TLBTR_WOM
                                | SPR_TLBTR_A
                                | SPR_TLBTR_D
                                | SPR_ITLBTR_SXE
                                | SPR_ITLBTR_UXE))
                    };
                    self.cpu.sprs.set(regno, masked);
                } else if (SPR_GPR_BASE..SPR_GPR_BASE + MAX_GPRS as u16).contains(&regno) {
                    self.setsim_reg((regno - SPR_GPR_BASE) as u32, value);
                }
            }
        }
    }

    pub fn mfspr(&mut self, regno: u16) -> u32 {
        match regno {
            SPR_NPC => {
                // While stalled with a rewritten NPC the pipeline is flushed
                // and strict mode reports 0 until unstall.
                if self.config.sim.strict_npc && self.cpu.npc_not_valid {
                    0
                } else {
                    self.cpu.pc
                }
            }
            SPR_TTCR => self.spr_read_ttcr(),
            SPR_FPCSR if !self.config.cpu.hardfloat => 0,
            r if (SPR_GPR_BASE..SPR_GPR_BASE + MAX_GPRS as u16).contains(&r) => {
                self.cpu.reg[(r - SPR_GPR_BASE) as usize]
            }
            _ => self.cpu.sprs.get(regno),
        }
    }

    /// The debugger redirected us to a new address. Re-setting the current
    /// PC is a no-op so a pending delay slot is not trashed by a `stepi`.
    pub fn set_npc(&mut self, addr: u32) {
        if addr == self.cpu.pc {
            return;
        }
        self.cpu.pc = addr;
        if addr == 0 && self.config.sim.verbose {
            warn!("PC just set to 0");
        }
        self.cpu.delay_insn = false;
        self.cpu.pcnext = addr.wrapping_add(4);
        debug!("npc set to {addr:08x}");
        if self.runtime.stalled {
            self.cpu.npc_not_valid = true;
        }
    }

    /// Monitor `r`/`info` support: the important SPRs at a glance.
    pub fn sprs_status(&mut self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "VR   : 0x{:08x}  UPR  : 0x{:08x}\n",
            self.cpu.sprs.get(SPR_VR),
            self.cpu.sprs.get(SPR_UPR)
        ));
        out.push_str(&format!("SR   : 0x{:08x}\n", self.cpu.sprs.get(SPR_SR)));
        out.push_str(&format!(
            "MACLO: 0x{:08x}  MACHI: 0x{:08x}\n",
            self.cpu.sprs.get(SPR_MACLO),
            self.cpu.sprs.get(SPR_MACHI)
        ));
        out.push_str(&format!(
            "EPCR0: 0x{:08x}  EEAR0: 0x{:08x}  ESR0 : 0x{:08x}\n",
            self.cpu.sprs.get(SPR_EPCR_BASE),
            self.cpu.sprs.get(SPR_EEAR_BASE),
            self.cpu.sprs.get(SPR_ESR_BASE)
        ));
        out.push_str(&format!(
            "TTMR : 0x{:08x}  TTCR : 0x{:08x}\n",
            self.cpu.sprs.get(SPR_TTMR),
            self.spr_read_ttcr()
        ));
        out.push_str(&format!(
            "PICMR: 0x{:08x}  PICSR: 0x{:08x}\n",
            self.cpu.sprs.get(SPR_PICMR),
            self.cpu.sprs.get(SPR_PICSR)
        ));
        out.push_str(&format!(
            "PPC  : 0x{:08x}  NPC  : 0x{:08x}\n",
            self.cpu.sprs.get(SPR_PPC),
            self.mfspr(SPR_NPC)
        ));
        out
    }
}
