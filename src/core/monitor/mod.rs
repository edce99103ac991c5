//! Interactive command prompt, entered on ctrl-C, breakpoints or `-i`.

use std::fs::File;
use std::io::{self, Write as _};

use tracing::warn;

use crate::core::cpu::disassembler;
use crate::core::emu::Simulator;
use crate::core::spr::*;

/// The fixed command table; names complete against unambiguous prefixes.
const COMMANDS: &[&str] = &[
    "q", "help", "t", "dm", "pm", "pr", "pc", "breaks", "break", "r", "de", "reset", "hist",
    "stall", "unstall", "stats", "info", "run", "set", "setdbch",
];

fn parse_num(s: &str) -> Option<u32> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        u32::from_str_radix(s, 16).ok().or_else(|| s.parse().ok())
    }
}

impl Simulator {
    fn parse_addr(&self, s: &str) -> Option<u32> {
        if s.starts_with(|c: char| c.is_ascii_digit()) {
            parse_num(s)
        } else {
            match self.labels.eval(s) {
                0 => parse_num(s),
                a => Some(a),
            }
        }
    }

    fn dump_regs(&mut self) -> String {
        let mut out = String::new();
        let pa = self.peek_into_itlb(self.cpu.iqueue.insn_addr);
        out.push_str(&format!(
            "{:08x}: {} (executed) [cycle {}, #{}]\n",
            self.cpu.iqueue.insn_addr,
            disassembler::disassemble(self.mem.read_direct::<32>(pa)),
            self.runtime.cycles,
            self.runtime.instructions
        ));
        let npc_pa = self.peek_into_itlb(self.cpu.pc);
        if npc_pa != 0 || self.cpu.pc == 0 {
            out.push_str(&format!(
                "{:08x}: {} (next insn) {}\n",
                self.cpu.pc,
                disassembler::disassemble(self.mem.read_direct::<32>(npc_pa)),
                if self.cpu.delay_insn { "(delay insn)" } else { "" }
            ));
        } else {
            out.push_str(&format!(
                "{:08x}: : xxxxxxxx  ITLB miss follows\n",
                self.cpu.pc
            ));
        }
        for r in 0..MAX_GPRS {
            out.push_str(&format!("GPR{r:02}: {:08x}  ", self.cpu.reg[r]));
            if r % 4 == 3 {
                out.push('\n');
            }
        }
        out.push_str(&format!(
            "flag: {}\n",
            self.cpu.sprs.test(SPR_SR, SPR_SR_F) as u32
        ));
        out
    }

    fn dump_memory(&mut self, from: u32, to: u32) -> String {
        let mut out = String::new();
        let mut addr = from & !3;
        let mut count = 0;
        while addr <= to {
            if count % 4 == 0 {
                if count != 0 {
                    out.push('\n');
                }
                out.push_str(&format!("{addr:08x}: "));
            }
            out.push_str(&format!("{:08x} ", self.mem.read_direct::<32>(addr)));
            count += 1;
            addr = addr.wrapping_add(4);
            if addr == 0 {
                break;
            }
        }
        out.push('\n');
        out
    }

    fn disassemble_memory(&mut self, from: u32, to: u32) -> String {
        let mut out = String::new();
        let mut addr = from & !3;
        while addr <= to {
            if let Some(label) = self.labels.get(addr) {
                out.push_str(&format!("{label}:\n"));
            }
            let word = self.mem.read_direct::<32>(addr);
            out.push_str(&format!(
                "{addr:08x}: {word:08x}  {}\n",
                disassembler::disassemble(word)
            ));
            addr = addr.wrapping_add(4);
            if addr == 0 {
                break;
            }
        }
        out
    }

    /// Execute one monitor command line; returns the printable output and
    /// whether the prompt should close (quit or resume execution).
    pub fn exec_command(&mut self, line: &str) -> (String, bool) {
        // `cmd args > file` redirects the command output
        let (line, redirect) = match line.split_once('>') {
            Some((l, f)) => (l, Some(f.trim().to_string())),
            None => (line, None),
        };
        let mut words = line.split_whitespace();
        let Some(cmd_word) = words.next() else {
            return (String::new(), false);
        };
        let args: Vec<&str> = words.collect();

        // complete against the command table
        let cmd = if COMMANDS.contains(&cmd_word) {
            cmd_word.to_string()
        } else {
            let matches: Vec<&&str> =
                COMMANDS.iter().filter(|c| c.starts_with(cmd_word)).collect();
            match matches.as_slice() {
                [one] => one.to_string(),
                [] => {
                    return (format!("unknown command {cmd_word}\n"), false);
                }
                many => {
                    return (
                        format!(
                            "ambiguous command {cmd_word}: {}\n",
                            many.iter().map(|c| **c).collect::<Vec<_>>().join(" ")
                        ),
                        false,
                    );
                }
            }
        };

        let mut out = String::new();
        let mut quit = false;

        match cmd.as_str() {
            "q" => {
                self.sim_done();
                quit = true;
            }
            "help" => {
                out.push_str("commands: ");
                out.push_str(&COMMANDS.join(" "));
                out.push('\n');
            }
            "r" => out.push_str(&self.dump_regs()),
            "t" => {
                self.runtime.cont_run = 1;
                self.runtime.cont_run_hush = false;
                quit = true;
            }
            "run" => {
                let n = args
                    .first()
                    .and_then(|s| s.parse::<i64>().ok())
                    .unwrap_or(-1);
                self.runtime.cont_run = n;
                self.runtime.cont_run_hush = args.get(1) == Some(&"hush");
                quit = true;
            }
            "pr" => match (args.first().and_then(|s| parse_num(s)), args.get(1).and_then(|s| parse_num(s))) {
                (Some(reg), Some(val)) if reg < MAX_GPRS as u32 => {
                    self.setsim_reg(reg, val);
                }
                _ => out.push_str("usage: pr <register> <value>\n"),
            },
            "dm" => match args.first().and_then(|s| self.parse_addr(s)) {
                Some(from) => {
                    let to = args.get(1).and_then(|s| self.parse_addr(s)).unwrap_or(from);
                    out.push_str(&self.dump_memory(from, to));
                }
                None => out.push_str("usage: dm <fromaddr> [<toaddr>]\n"),
            },
            "de" => match args.first().and_then(|s| self.parse_addr(s)) {
                Some(from) => {
                    let to = args.get(1).and_then(|s| self.parse_addr(s)).unwrap_or(from);
                    out.push_str(&self.disassemble_memory(from, to));
                }
                None => out.push_str("usage: de <fromaddr> [<toaddr>]\n"),
            },
            "pm" => match (
                args.first().and_then(|s| self.parse_addr(s)),
                args.get(1).and_then(|s| parse_num(s)),
            ) {
                (Some(addr), Some(val)) => {
                    self.dc_inv(addr);
                    self.ic_inv(addr);
                    self.mem.write_prog::<32>(addr, val);
                }
                _ => out.push_str("usage: pm <addr> <value>\n"),
            },
            "pc" => match args.first().and_then(|s| parse_num(s)) {
                Some(val) => self.set_npc(val),
                None => out.push_str("usage: pc <value>\n"),
            },
            "break" => match args.first().and_then(|s| self.parse_addr(s)) {
                Some(addr) => {
                    if self.monitor_breakpoints.remove(&addr) {
                        out.push_str(&format!("breakpoint at {addr:08x} cleared\n"));
                    } else {
                        self.monitor_breakpoints.insert(addr);
                        out.push_str(&format!("breakpoint at {addr:08x} set\n"));
                    }
                }
                None => out.push_str("usage: break <addr or label>\n"),
            },
            "breaks" => {
                for addr in &self.monitor_breakpoints {
                    match self.labels.get(*addr) {
                        Some(l) => out.push_str(&format!("  {addr:08x} ({l})\n")),
                        None => out.push_str(&format!("  {addr:08x}\n")),
                    }
                }
            }
            "reset" => self.sim_reset(),
            "hist" => {
                if !self.config.sim.history {
                    out.push_str("history not enabled (sim.history)\n");
                } else {
                    for addr in self.hist.iter_oldest_first().collect::<Vec<_>>() {
                        if addr != 0 {
                            let word = self.mem.read_direct::<32>(self.peek_into_itlb(addr));
                            out.push_str(&format!(
                                "{addr:08x}: {}\n",
                                disassembler::disassemble(word)
                            ));
                        }
                    }
                }
            }
            "stall" => self.set_stall_state(true),
            "unstall" => self.set_stall_state(false),
            "stats" => {
                if args.first() == Some(&"clear") {
                    self.runtime.reset_cycles = self.runtime.cycles;
                    self.runtime.reset_instructions = self.runtime.instructions;
                    self.dmmu.tlbhit = 0;
                    self.dmmu.tlbmiss = 0;
                    self.immu.tlbhit = 0;
                    self.immu.tlbmiss = 0;
                    out.push_str("statistics cleared\n");
                } else {
                    out.push_str(&format!(
                        "cycles {}, insn #{}\n",
                        self.runtime.cycles - self.runtime.reset_cycles,
                        self.runtime.instructions - self.runtime.reset_instructions
                    ));
                    out.push_str(&format!(
                        "dmmu: {} hits, {} misses; immu: {} hits, {} misses\n",
                        self.dmmu.tlbhit, self.dmmu.tlbmiss, self.immu.tlbhit, self.immu.tlbmiss
                    ));
                    out.push_str(&format!(
                        "sbuf: {} wait cycles of {}\n",
                        self.sbuf.wait_cyc, self.sbuf.total_cyc
                    ));
                }
            }
            "info" => {
                out.push_str(&self.sprs_status());
                out.push_str(&format!(
                    "ic: {} ({} ways, {} sets, {} byte lines)\n",
                    if self.ic.enabled { "present" } else { "absent" },
                    self.ic.nways,
                    self.ic.nsets,
                    self.ic.blocksize
                ));
                out.push_str(&format!(
                    "dc: {} ({} ways, {} sets, {} byte lines)\n",
                    if self.dc.enabled { "present" } else { "absent" },
                    self.dc.nways,
                    self.dc.nsets,
                    self.dc.blocksize
                ));
                out.push_str(&format!(
                    "immu: {}; dmmu: {}; pic: {}; tick: {}\n",
                    self.immu.enabled,
                    self.dmmu.enabled,
                    self.config.pic.enabled,
                    self.config.tick.enabled
                ));
            }
            "set" => {
                if args.len() == 3 {
                    if self.config.set_param(args[0], args[1], args[2]) {
                        out.push_str(&format!("{}:{} = {}\n", args[0], args[1], args[2]));
                    } else {
                        out.push_str(&format!("no such parameter {}.{}\n", args[0], args[1]));
                    }
                } else {
                    out.push_str("usage: set <section> <param> <value>\n");
                }
            }
            "setdbch" => match (args.first(), self.logger.as_ref()) {
                (Some(spec), Some(logger)) => logger.set_log_level(spec),
                (None, _) => out.push_str("usage: setdbch <level spec>\n"),
                (_, None) => out.push_str("logging not initialised\n"),
            },
            _ => unreachable!(),
        }

        if let Some(file) = redirect {
            match File::create(&file) {
                Ok(mut f) => {
                    let _ = f.write_all(out.as_bytes());
                    out = String::new();
                }
                Err(e) => warn!("cannot redirect to {file}: {e}"),
            }
        }
        (out, quit)
    }

    /// The prompt loop: read commands until told to resume or quit.
    pub fn handle_sim_command(&mut self) {
        let stdin = io::stdin();
        loop {
            print!("(sim) ");
            let _ = io::stdout().flush();
            let mut line = String::new();
            match stdin.read_line(&mut line) {
                Ok(0) => {
                    // EOF: nothing more to read, end the session
                    self.sim_done();
                    return;
                }
                Ok(_) => (),
                Err(e) => {
                    warn!("stdin: {e}");
                    self.sim_done();
                    return;
                }
            }
            let (out, quit) = self.exec_command(line.trim());
            print!("{out}");
            if quit {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_memory_commands() {
        let mut sim = Simulator::for_test();
        sim.exec_command("pr 3 0x1234");
        assert_eq!(sim.cpu.reg[3], 0x1234);
        sim.exec_command("pm 1000 deadbeef");
        let (out, _) = sim.exec_command("dm 1000");
        assert!(out.contains("deadbeef"));
        sim.exec_command("pc 0x2000");
        assert_eq!(sim.cpu.pc, 0x2000);
    }

    #[test]
    fn breakpoints_toggle_and_accept_labels() {
        let mut sim = Simulator::for_test();
        sim.labels.add(0x1400, "main");
        sim.exec_command("break main");
        assert!(sim.monitor_breakpoints.contains(&0x1400));
        let (out, _) = sim.exec_command("breaks");
        assert!(out.contains("1400"));
        sim.exec_command("break main");
        assert!(sim.monitor_breakpoints.is_empty());
    }

    #[test]
    fn prefix_completion_is_unambiguous_only() {
        let mut sim = Simulator::for_test();
        // "bre" uniquely resolves within {break, breaks}? No: ambiguous.
        let (out, _) = sim.exec_command("bre 100");
        assert!(out.contains("ambiguous"));
        let (out, _) = sim.exec_command("brea 100");
        assert!(out.contains("ambiguous"));
        // "un" resolves to unstall
        sim.set_stall_state(true);
        sim.exec_command("un");
        assert!(!sim.runtime.stalled);
    }

    #[test]
    fn run_sets_continuation_counter() {
        let mut sim = Simulator::for_test();
        let (_, quit) = sim.exec_command("run 5 hush");
        assert!(quit);
        assert_eq!(sim.runtime.cont_run, 5);
        assert!(sim.runtime.cont_run_hush);
        let (_, quit) = sim.exec_command("t");
        assert!(quit);
        assert_eq!(sim.runtime.cont_run, 1);
    }

    #[test]
    fn set_command_updates_config() {
        let mut sim = Simulator::for_test();
        sim.exec_command("set sim verbose 1");
        assert!(sim.config.sim.verbose);
        let (out, _) = sim.exec_command("set sim bogus 1");
        assert!(out.contains("no such parameter"));
    }
}
