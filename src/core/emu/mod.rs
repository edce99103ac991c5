//! The simulator: one struct owning every component, and the main loop
//! driving fetch/execute, the scheduler and the stalled-CPU debug loop.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::info;

use crate::core::cache::Cache;
use crate::core::config::{Config, MemoryKind};
use crate::core::cpu::disassembler;
use crate::core::cpu::{CpuState, ExecHistory, StoreBuffer};
use crate::core::debug::rsp::{RspServer, SIGNAL_TRAP};
use crate::core::debug::DebugUnit;
use crate::core::except::Except;
use crate::core::loader::labels::Labels;
use crate::core::memory::{MemoryMap, Ram};
use crate::core::mmu::{Mmu, MmuKind};
use crate::core::sched::{JobKind, Scheduler};
use crate::core::spr::*;
use crate::core::tick::Tick;

/// Pending ctrl-C presses, set from the signal handler.
pub static CTRLC_PENDING: AtomicU32 = AtomicU32::new(0);

/// How often the permanent jobs poll, in simulated cycles.
const CTRLC_POLL_PERIOD: i64 = 100_000;
const RSP_POLL_PERIOD: i64 = 20_000;

/// Counters and run-state that are not architectural.
pub struct Runtime {
    pub cycles: i64,
    /// Memory subsystem cycles accumulated by the instruction in flight.
    pub mem_cycles: i64,
    pub instructions: u64,
    pub reset_cycles: i64,
    pub reset_instructions: u64,
    pub stalled: bool,
    pub halted: bool,
    /// Drop into the interactive prompt at the next boundary.
    pub iprompt: bool,
    /// Simulation finished; the main loop unwinds.
    pub done: bool,
    pub exit_code: u32,
    /// Instructions left to run before returning to the prompt; negative
    /// means free-running.
    pub cont_run: i64,
    pub cont_run_hush: bool,
}

impl Runtime {
    fn new() -> Self {
        Runtime {
            cycles: 0,
            mem_cycles: 0,
            instructions: 0,
            reset_cycles: 0,
            reset_instructions: 0,
            stalled: false,
            halted: false,
            iprompt: false,
            done: false,
            exit_code: 0,
            cont_run: -1,
            cont_run_hush: false,
        }
    }
}

pub struct Simulator {
    pub config: Config,
    pub runtime: Runtime,
    pub cpu: CpuState,
    pub mem: MemoryMap,
    pub ic: Cache,
    pub dc: Cache,
    pub immu: Mmu,
    pub dmmu: Mmu,
    pub tick: Tick,
    pub sched: Scheduler,
    pub du: DebugUnit,
    pub rsp: Option<RspServer>,
    pub labels: Labels,
    pub hist: ExecHistory,
    pub sbuf: StoreBuffer,
    pub monitor_breakpoints: HashSet<u32>,
    pub logger: Option<crate::log::Logger>,
    exe_log: Option<std::fs::File>,
}

impl Simulator {
    pub fn new(config: Config) -> Result<Self, String> {
        let mut sim = Simulator {
            config,
            runtime: Runtime::new(),
            cpu: CpuState::new(),
            mem: MemoryMap::new(),
            ic: Cache::new("ic"),
            dc: Cache::new("dc"),
            immu: Mmu::new(MmuKind::Insn),
            dmmu: Mmu::new(MmuKind::Data),
            tick: Tick::new(),
            sched: Scheduler::new(),
            du: DebugUnit::new(),
            rsp: None,
            labels: Labels::new(),
            hist: ExecHistory::new(),
            sbuf: StoreBuffer::new(),
            monitor_breakpoints: HashSet::new(),
            logger: None,
            exe_log: None,
        };
        sim.apply_config()?;
        sim.sim_reset();
        Ok(sim)
    }

    /// A simulator over 2 MiB of RAM at address zero, for unit tests.
    #[cfg(test)]
    pub fn for_test() -> Self {
        let mut config = Config::default();
        config.memories.push(crate::core::config::MemoryConfig {
            baseaddr: 0,
            size: 0x0020_0000,
            delayr: 0,
            delayw: 0,
            ..Default::default()
        });
        Simulator::new(config).unwrap()
    }

    /// Instantiate the configured memory regions and component geometries.
    fn apply_config(&mut self) -> Result<(), String> {
        self.mem.report_errs = self.config.sim.report_mem_errs;

        for m in self.config.memories.clone() {
            let mut ram = Ram::new(m.size as usize, m.readonly);
            match m.kind {
                MemoryKind::Unmodified | MemoryKind::Zero => (),
                MemoryKind::Pattern => ram.fill_pattern(m.pattern),
                MemoryKind::Random => ram.fill_random(m.random_seed),
            }
            let idx = self.mem.reg_mem_area(m.baseaddr, m.size, m.mc, Box::new(ram))?;
            self.mem.adjust_rw_delay(idx, m.delayr, m.delayw);
            if let Some(log) = &m.log {
                self.mem.set_log(idx, log);
            }
            if self.config.sim.verbose {
                info!(
                    "memory \"{}\": {:#010x} bytes at {:#010x}",
                    m.name, m.size, m.baseaddr
                );
            }
        }

        let ic_cfg = self.config.ic.clone();
        self.ic.enabled = ic_cfg.enabled;
        self.ic.set_nsets(ic_cfg.nsets);
        self.ic.set_nways(ic_cfg.nways);
        self.ic.set_blocksize(ic_cfg.blocksize);
        self.ic.set_ustates(ic_cfg.ustates);
        self.ic.load_hitdelay = ic_cfg.hitdelay;
        self.ic.load_missdelay = ic_cfg.missdelay;

        let dc_cfg = self.config.dc.clone();
        self.dc.enabled = dc_cfg.enabled;
        self.dc.set_nsets(dc_cfg.nsets);
        self.dc.set_nways(dc_cfg.nways);
        self.dc.set_blocksize(dc_cfg.blocksize);
        self.dc.set_ustates(dc_cfg.ustates);
        self.dc.load_hitdelay = dc_cfg.load_hitdelay;
        self.dc.load_missdelay = dc_cfg.load_missdelay;
        self.dc.store_hitdelay = dc_cfg.store_hitdelay;
        self.dc.store_missdelay = dc_cfg.store_missdelay;

        let immu_cfg = self.config.immu.clone();
        self.immu.enabled = immu_cfg.enabled;
        self.immu.set_nsets(immu_cfg.nsets);
        self.immu.set_nways(immu_cfg.nways);
        self.immu.set_pagesize(immu_cfg.pagesize);
        self.immu.hitdelay = immu_cfg.hitdelay;
        self.immu.missdelay = immu_cfg.missdelay;
        self.immu.finalize();

        let dmmu_cfg = self.config.dmmu.clone();
        self.dmmu.enabled = dmmu_cfg.enabled;
        self.dmmu.set_nsets(dmmu_cfg.nsets);
        self.dmmu.set_nways(dmmu_cfg.nways);
        self.dmmu.set_pagesize(dmmu_cfg.pagesize);
        self.dmmu.hitdelay = dmmu_cfg.hitdelay;
        self.dmmu.missdelay = dmmu_cfg.missdelay;
        self.dmmu.finalize();

        if self.config.cpu.sbuf_len >= crate::core::cpu::MAX_SBUF_LEN {
            tracing::warn!(
                "sbuf_len too large, clamped to {}",
                crate::core::cpu::MAX_SBUF_LEN - 1
            );
            self.config.cpu.sbuf_len = crate::core::cpu::MAX_SBUF_LEN - 1;
        }

        if self.config.sim.exe_log {
            match std::fs::File::create(&self.config.sim.exe_log_file) {
                Ok(f) => self.exe_log = Some(f),
                Err(e) => {
                    tracing::warn!(
                        "cannot open execution log {}: {e}; disabled",
                        self.config.sim.exe_log_file
                    );
                    self.config.sim.exe_log = false;
                }
            }
        }

        if self.config.debug.enabled && self.config.debug.rsp_enabled {
            let mut rsp = RspServer::new(self.config.debug.rsp_port);
            // An attaching client finds a target stopped at the entry point.
            rsp.sigval = SIGNAL_TRAP;
            self.rsp = Some(rsp);
        }

        Ok(())
    }

    /// Rebuild the unit-present and configuration SPRs from what was
    /// actually accepted (bad config values must leave these untouched).
    fn apply_spr_config(&mut self) {
        let mut upr = SPR_UPR_UP;
        if self.dc.enabled {
            upr |= SPR_UPR_DCP;
        }
        if self.ic.enabled {
            upr |= SPR_UPR_ICP;
        }
        if self.dmmu.enabled {
            upr |= SPR_UPR_DMP;
        }
        if self.immu.enabled {
            upr |= SPR_UPR_IMP;
        }
        if self.config.pic.enabled {
            upr |= SPR_UPR_PICP;
        }
        if self.config.pm.enabled {
            upr |= SPR_UPR_PMP;
        }
        if self.config.tick.enabled {
            upr |= SPR_UPR_TTP;
        }
        if self.config.debug.enabled {
            upr |= SPR_UPR_DUP;
        }
        self.cpu.sprs.set(SPR_UPR, upr);

        let ver = (self.config.cpu.ver & 0xff) << 24 | (self.config.cpu.rev & 0x3f);
        self.cpu.sprs.set(SPR_VR, ver);
        self.cpu.sprs.set(SPR_CPUCFGR, SPR_CPUCFGR_VALUE);

        let cache_cfg = |c: &Cache| {
            let mut v = (c.nsets.trailing_zeros() << SPR_DCCFGR_NCS_OFF) & SPR_DCCFGR_NCS;
            v |= (c.nways.trailing_zeros() << SPR_DCCFGR_NCW_OFF) & SPR_DCCFGR_NCW;
            if c.blocksize == 32 {
                v |= SPR_DCCFGR_CBS;
            }
            v
        };
        self.cpu.sprs.set(SPR_DCCFGR, cache_cfg(&self.dc));
        self.cpu.sprs.set(SPR_ICCFGR, cache_cfg(&self.ic));

        let mmu_cfg = |m: &Mmu| {
            let mut v = ((m.nsets.trailing_zeros() << SPR_DMMUCFGR_NTS_OFF) as u32)
                & SPR_DMMUCFGR_NTS;
            v |= ((m.nways as u32 - 1) << SPR_DMMUCFGR_NTW_OFF) & SPR_DMMUCFGR_NTW;
            v
        };
        self.cpu.sprs.set(SPR_DMMUCFGR, mmu_cfg(&self.dmmu));
        self.cpu.sprs.set(SPR_IMMUCFGR, mmu_cfg(&self.immu));
    }

    /// Full simulator reset: architectural state to reset defaults and the
    /// permanent jobs back on the queue.
    pub fn sim_reset(&mut self) {
        self.sched.clear();
        self.sched.add(JobKind::CtrlCPoll, CTRLC_POLL_PERIOD);
        if self.rsp.is_some() {
            self.sched.add(JobKind::RspPoll, RSP_POLL_PERIOD);
        }

        self.cpu.sprs.reset();
        self.apply_spr_config();
        self.ic.reset();
        self.dc.reset();
        self.tick_reset();
        self.pic_reset();
        self.du_reset();
        self.cpu_reset();

        // With a remote debugger configured, wait stalled for it to attach.
        if self.rsp.is_some() {
            self.set_stall_state(true);
        }

        if self.config.sim.verbose {
            info!("simulator reset; starting at {:#010x}", self.cpu.pc);
        }
    }

    /// Mark the run as finished; the main loop returns at the next boundary.
    pub fn sim_done(&mut self) {
        self.runtime.done = true;
    }

    /// Schedule a job for the next instruction boundary, compensating for a
    /// head job that has already overrun.
    pub fn sched_next_insn(&mut self, kind: JobKind) {
        let mut cycles = 1;
        if let Some(head) = self.sched.head_time() {
            if head < 0 {
                cycles -= head;
            }
        }
        self.sched.add(kind, cycles);
    }

    fn dispatch_job(&mut self, kind: JobKind) {
        match kind {
            JobKind::TickRestart => self.tick_restart_job(),
            JobKind::TickOneShot => self.tick_one_shot_job(),
            JobKind::TickRaise => self.tick_raise_job(),
            JobKind::PicDeliver => self.pic_deliver_job(),
            JobKind::RspPoll => {
                self.rsp_poll_job();
                self.sched.add(JobKind::RspPoll, RSP_POLL_PERIOD);
            }
            JobKind::CtrlCPoll => {
                let presses = CTRLC_PENDING.swap(0, Ordering::SeqCst);
                if presses >= 2 {
                    eprintln!("Interrupted again: exiting");
                    std::process::exit(1);
                } else if presses == 1 {
                    self.runtime.iprompt = true;
                }
                self.sched.add(JobKind::CtrlCPoll, CTRLC_POLL_PERIOD);
            }
        }
    }

    fn trace_instr(&mut self) {
        let pa = self.peek_into_itlb(self.cpu.iqueue.insn_addr);
        if pa == 0 && self.cpu.iqueue.insn_addr != 0 {
            println!("instruction address translation failed: no trace available");
            return;
        }
        let addr = if self.config.sim.trace_phys {
            pa
        } else {
            self.cpu.iqueue.insn_addr
        };
        println!(
            "S {addr:08x}: {:08x} {}",
            self.cpu.iqueue.insn,
            disassembler::disassemble(self.cpu.iqueue.insn)
        );
    }

    /// One iteration of the main loop: one instruction (unless asleep),
    /// cycle accounting, then any due scheduler jobs. Returns true on a
    /// monitor breakpoint.
    pub fn step(&mut self) -> bool {
        let time_start = self.runtime.cycles;
        self.runtime.mem_cycles = 0;
        let mut breakpoint = false;

        let sleeping = self.config.pm.enabled
            && self.cpu.sprs.test(SPR_PMR, SPR_PMR_DME | SPR_PMR_SME);
        if !sleeping {
            breakpoint = self.cpu_clock();

            let stepping_loud = self.runtime.cont_run > 0 && !self.runtime.cont_run_hush;
            if !self.config.sim.hush || stepping_loud {
                self.trace_instr();
            }

            if let Some(log) = self.exe_log.as_mut() {
                use std::io::Write;
                let _ = writeln!(
                    log,
                    "EXECUTED({:>11}): {:08x}: {:08x}  {}",
                    self.runtime.instructions,
                    self.cpu.iqueue.insn_addr,
                    self.cpu.iqueue.insn,
                    disassembler::disassemble(self.cpu.iqueue.insn)
                );
            }

            // single-step mode stalls after every instruction
            if self.config.debug.enabled && self.cpu.sprs.test(SPR_DMR1, SPR_DMR1_ST) {
                self.set_stall_state(true);
                if self.config.debug.rsp_enabled {
                    self.rsp_exception(Except::Trap);
                }
            }
        }

        self.runtime.cycles += 1 + self.runtime.mem_cycles;
        self.sched.advance(self.runtime.cycles - time_start);
        while let Some(job) = self.sched.pop_due() {
            self.dispatch_job(job);
        }

        breakpoint
    }

    /// The outer execution loop. Returns when the simulated program (or the
    /// user) ends the session.
    pub fn exec_main(&mut self) {
        if self.config.sim.iprompt {
            self.runtime.iprompt = true;
        }
        loop {
            if self.runtime.done {
                return;
            }

            if self.config.debug.enabled {
                while self.runtime.stalled {
                    if self.config.debug.rsp_enabled {
                        self.handle_rsp();
                    } else {
                        eprintln!(
                            "ERROR: CPU stalled and GDB connection not enabled: \
                             invoking CLI and terminating"
                        );
                        self.handle_sim_command();
                        self.sim_done();
                    }
                    if self.runtime.iprompt {
                        self.runtime.iprompt = false;
                        self.handle_sim_command();
                    }
                    if self.runtime.done {
                        return;
                    }
                }
            }

            if self.runtime.iprompt {
                self.runtime.iprompt = false;
                self.handle_sim_command();
                if self.runtime.done {
                    return;
                }
                continue;
            }

            if self.step() {
                println!("Breakpoint hit.");
                self.handle_sim_command();
            }

            if self.runtime.cont_run > 0 {
                self.runtime.cont_run -= 1;
                if self.runtime.cont_run == 0 {
                    self.runtime.iprompt = true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cpu::instruction::{index_of, tables};
    use crate::core::spr::*;

    /// Small assembler facade for the end-to-end scenarios.
    fn asm(name: &str, vals: &[(char, u32)]) -> u32 {
        tables().encode(index_of(name).unwrap(), vals)
    }

    fn poke_program(sim: &mut Simulator, base: u32, words: &[u32]) {
        for (i, w) in words.iter().enumerate() {
            sim.mem.write_prog::<32>(base + 4 * i as u32, *w);
        }
    }

    fn run_steps(sim: &mut Simulator, max: usize) {
        for _ in 0..max {
            if sim.runtime.done {
                break;
            }
            sim.step();
        }
    }

    #[test]
    fn scenario_arithmetic_and_flag() {
        let mut sim = Simulator::for_test();
        poke_program(
            &mut sim,
            0x100,
            &[
                asm("l.addi", &[('D', 3), ('A', 0), ('I', 7)]),
                asm("l.addi", &[('D', 4), ('A', 0), ('I', 5)]),
                asm("l.sub", &[('D', 5), ('A', 3), ('B', 4)]),
                asm("l.sfeqi", &[('A', 5), ('I', 2)]),
                asm("l.bf", &[('N', 3)]), // to 0x11c
                asm("l.nop", &[('K', 0)]),
                asm("l.ori", &[('D', 3), ('A', 0), ('K', 0xdead)]),
                asm("l.ori", &[('D', 3), ('A', 0), ('K', 0xbeef)]),
                asm("l.nop", &[('K', 1)]), // exit
            ],
        );
        run_steps(&mut sim, 50);
        assert!(sim.runtime.done);
        assert_eq!(sim.cpu.reg[5], 2);
        assert!(sim.cpu.sprs.test(SPR_SR, SPR_SR_F));
        assert_eq!(sim.cpu.reg[3], 0xbeef);
        assert_eq!(sim.runtime.exit_code, 0xbeef);
    }

    #[test]
    fn scenario_dtlb_miss_then_refill() {
        let mut config = Config::default();
        config.memories.push(crate::core::config::MemoryConfig {
            baseaddr: 0,
            size: 0x0020_0000,
            delayr: 0,
            delayw: 0,
            ..Default::default()
        });
        config.dmmu.enabled = true;
        config.dmmu.nsets = 1;
        config.dmmu.nways = 1;
        config.dmmu.pagesize = 8192;
        let mut sim = Simulator::new(config).unwrap();

        sim.mem.write_prog::<32>(0x4000, 0x1234_5678);
        poke_program(
            &mut sim,
            0x100,
            &[
                asm("l.ori", &[('D', 4), ('A', 0), ('K', 0x4000)]),
                asm("l.lwz", &[('D', 3), ('I', 0), ('A', 4)]),
                asm("l.nop", &[('K', 1)]),
            ],
        );
        // DTLB miss handler: install vpn 0x4000 -> ppn 0x4000, supervisor
        // read enabled, then return to the faulting load.
        poke_program(
            &mut sim,
            0x900,
            &[
                asm("l.ori", &[('D', 5), ('A', 0), ('K', 0x4001)]), // mr: vpn|V
                asm("l.mtspr", &[('A', 0), ('B', 5), ('K', spr_dtlbmr_base(0) as u32)]),
                asm("l.ori", &[('D', 6), ('A', 0), ('K', 0x4100)]), // tr: ppn|SRE
                asm("l.mtspr", &[('A', 0), ('B', 6), ('K', spr_dtlbtr_base(0) as u32)]),
                asm("l.rfe", &[]),
            ],
        );
        sim.cpu.sprs.set_bits(SPR_SR, SPR_SR_DME);

        // run to the load and through the miss
        run_steps(&mut sim, 2);
        assert_eq!(sim.cpu.pc, 0x900);
        assert_eq!(sim.cpu.sprs.get(SPR_EPCR_BASE), 0x104);
        assert_eq!(sim.cpu.sprs.get(SPR_EEAR_BASE), 0x4000);
        // DME was masked on entry and comes back with rfe
        assert!(!sim.cpu.sprs.test(SPR_SR, SPR_SR_DME));

        run_steps(&mut sim, 20);
        assert!(sim.runtime.done);
        assert_eq!(sim.cpu.reg[3], 0x1234_5678);
    }

    #[test]
    fn scenario_delay_slot_page_fault() {
        let mut config = Config::default();
        config.memories.push(crate::core::config::MemoryConfig {
            baseaddr: 0,
            size: 0x0020_0000,
            delayr: 0,
            delayw: 0,
            ..Default::default()
        });
        config.dmmu.enabled = true;
        config.dmmu.nsets = 1;
        config.dmmu.nways = 1;
        let mut sim = Simulator::new(config).unwrap();

        poke_program(
            &mut sim,
            0x100,
            &[
                asm("l.j", &[('N', 0x40)]), // to 0x200
                asm("l.sw", &[('I', 0), ('A', 4), ('B', 5)]), // delay slot store
            ],
        );
        poke_program(&mut sim, 0x200, &[asm("l.nop", &[('K', 1)])]);
        // miss handler installs the mapping and returns to the branch
        poke_program(
            &mut sim,
            0x900,
            &[
                asm("l.ori", &[('D', 6), ('A', 0), ('K', 0x4001)]),
                asm("l.mtspr", &[('A', 0), ('B', 6), ('K', spr_dtlbmr_base(0) as u32)]),
                asm("l.ori", &[('D', 7), ('A', 0), ('K', 0x4300)]), // SRE|SWE
                asm("l.mtspr", &[('A', 0), ('B', 7), ('K', spr_dtlbtr_base(0) as u32)]),
                asm("l.rfe", &[]),
            ],
        );
        sim.cpu.reg[4] = 0x4000;
        sim.cpu.reg[5] = 0xfeed_f00d;
        sim.cpu.sprs.set_bits(SPR_SR, SPR_SR_DME);

        // branch, then the slot store faults
        run_steps(&mut sim, 2);
        assert_eq!(sim.cpu.pc, 0x900);
        // EPCR points at the branch, not the slot
        assert_eq!(sim.cpu.sprs.get(SPR_EPCR_BASE), 0x100);
        assert_eq!(sim.cpu.sprs.get(SPR_EEAR_BASE), 0x4000);
        assert!(!sim.cpu.delay_insn);

        // handler runs, branch re-executes, slot retried, program exits
        run_steps(&mut sim, 20);
        assert!(sim.runtime.done);
        assert_eq!(sim.mem.read_direct::<32>(0x4000), 0xfeed_f00d);
    }

    #[test]
    fn scenario_tick_timer_restart_mode() {
        let mut sim = Simulator::for_test();
        let ttmr_val: u32 = SPR_TTMR_RT | SPR_TTMR_IE | 100;
        poke_program(
            &mut sim,
            0x100,
            &[
                // TTMR = restart | IE | 100
                asm("l.movhi", &[('D', 4), ('K', ttmr_val >> 16)]),
                asm("l.ori", &[('D', 4), ('A', 4), ('K', ttmr_val & 0xffff)]),
                asm("l.mtspr", &[('A', 0), ('B', 4), ('K', SPR_TTMR as u32)]),
                // SR |= TEE
                asm("l.mfspr", &[('D', 3), ('A', 0), ('K', SPR_SR as u32)]),
                asm("l.ori", &[('D', 3), ('A', 3), ('K', SPR_SR_TEE as u32)]),
                asm("l.mtspr", &[('A', 0), ('B', 3), ('K', SPR_SR as u32)]),
                // spin
                asm("l.j", &[('N', 0)]),
                asm("l.nop", &[('K', 0)]),
            ],
        );
        // tick handler: clear IP by rewriting TTMR, return
        poke_program(
            &mut sim,
            0x500,
            &[
                asm("l.movhi", &[('D', 4), ('K', ttmr_val >> 16)]),
                asm("l.ori", &[('D', 4), ('A', 4), ('K', ttmr_val & 0xffff)]),
                asm("l.mtspr", &[('A', 0), ('B', 4), ('K', SPR_TTMR as u32)]),
                asm("l.rfe", &[]),
            ],
        );

        let mut entries = 0;
        let deadline = sim.runtime.cycles + 1040;
        while sim.runtime.cycles < deadline {
            sim.step();
            if sim.cpu.pc == 0x500 && sim.cpu.iqueue.insn_addr != 0x500 {
                // IP is visible to the handler on entry
                assert!(sim.cpu.sprs.test(SPR_TTMR, SPR_TTMR_IP));
                entries += 1;
            }
        }
        assert!(
            (9..=11).contains(&entries),
            "expected ~10 tick exceptions, got {entries}"
        );
    }

    #[test]
    fn npc_write_while_stalled_with_strict_npc() {
        let mut sim = Simulator::for_test();
        sim.config.sim.strict_npc = true;
        poke_program(&mut sim, 0x100, &[asm("l.nop", &[('K', 0)]); 8]);

        sim.set_stall_state(true);
        sim.mtspr(SPR_NPC, 0x110);
        // strict mode: reads return 0 while the pipeline is flushed
        assert_eq!(sim.mfspr(SPR_NPC), 0);
        sim.set_stall_state(false);
        assert_eq!(sim.mfspr(SPR_NPC), 0x110);
        sim.step();
        assert_eq!(sim.cpu.iqueue.insn_addr, 0x110);
    }

    #[test]
    fn single_step_stalls_after_one_instruction() {
        let mut sim = Simulator::for_test();
        sim.config.debug.enabled = true;
        poke_program(&mut sim, 0x100, &[asm("l.nop", &[('K', 0)]); 4]);
        sim.cpu.sprs.set_bits(SPR_DMR1, SPR_DMR1_ST);
        sim.step();
        assert!(sim.runtime.stalled);
        assert_eq!(sim.cpu.pc, 0x104);
    }

    #[test]
    fn illegal_instruction_vectors_with_epcr() {
        let mut sim = Simulator::for_test();
        poke_program(&mut sim, 0x100, &[0xffff_ffff]);
        sim.step();
        assert_eq!(sim.cpu.pc, 0x700);
        assert_eq!(sim.cpu.sprs.get(SPR_EPCR_BASE), 0x100);
        assert_eq!(sim.cpu.sprs.get(SPR_EEAR_BASE), 0x100);
    }

    #[test]
    fn misaligned_load_raises_alignment_with_eear() {
        let mut sim = Simulator::for_test();
        poke_program(
            &mut sim,
            0x100,
            &[
                asm("l.ori", &[('D', 4), ('A', 0), ('K', 0x1002)]),
                asm("l.lwz", &[('D', 3), ('I', 1), ('A', 4)]),
            ],
        );
        sim.step();
        sim.step();
        assert_eq!(sim.cpu.pc, 0x600);
        assert_eq!(sim.cpu.sprs.get(SPR_EEAR_BASE), 0x1003);
        assert_eq!(sim.cpu.sprs.get(SPR_EPCR_BASE), 0x104);
    }

    #[test]
    fn register_zero_stays_zero() {
        let mut sim = Simulator::for_test();
        poke_program(
            &mut sim,
            0x100,
            &[asm("l.addi", &[('D', 0), ('A', 0), ('I', 42)])],
        );
        sim.step();
        assert_eq!(sim.cpu.reg[0], 0);
    }

    #[test]
    fn syscall_returns_past_the_trap() {
        let mut sim = Simulator::for_test();
        poke_program(
            &mut sim,
            0x100,
            &[asm("l.nop", &[('K', 0)]), asm("l.sys", &[('K', 1)])],
        );
        sim.step();
        sim.step();
        assert_eq!(sim.cpu.pc, 0xc00);
        // syscall resumes at the next instruction
        assert_eq!(sim.cpu.sprs.get(SPR_EPCR_BASE), 0x108);
        // supervisor mode, interrupts masked
        assert!(sim.cpu.sprs.test(SPR_SR, SPR_SR_SM));
        assert!(!sim.cpu.sprs.test(SPR_SR, SPR_SR_IEE));
    }

    #[test]
    fn pic_delivery_waits_for_instruction_boundary() {
        let mut sim = Simulator::for_test();
        poke_program(&mut sim, 0x100, &[asm("l.nop", &[('K', 0)]); 8]);
        sim.cpu.sprs.set_bits(SPR_SR, SPR_SR_IEE);
        sim.cpu.sprs.set_bits(SPR_PICMR, 1 << 4);

        sim.report_interrupt(4);
        // nothing happened yet: the deliver job sits at the boundary
        assert_ne!(sim.cpu.pc, 0x800);
        sim.step();
        assert_eq!(sim.cpu.pc, 0x800);
        assert!(sim.cpu.sprs.test(SPR_PICSR, 1 << 4));
    }

    #[test]
    fn cycle_counter_is_monotonic() {
        let mut sim = Simulator::for_test();
        poke_program(&mut sim, 0x100, &[asm("l.nop", &[('K', 0)]); 16]);
        let mut last = sim.runtime.cycles;
        for _ in 0..10 {
            sim.step();
            assert!(sim.runtime.cycles > last);
            last = sim.runtime.cycles;
        }
    }
}
