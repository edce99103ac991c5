//! Configuration file handling.
//!
//! The file format is a flat declarative syntax:
//!
//! ```text
//! section memory
//!   baseaddr = 0x00000000
//!   size     = 0x00800000
//!   type     random
//! end
//! ```
//!
//! `/* ... */` comments are stripped, strings may be double quoted, the `=`
//! is optional. Unknown sections and keys produce warnings and are skipped.

use std::fs;

use tracing::warn;

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub verbose: bool,
    pub quiet: bool,
    pub report_mem_errs: bool,
    pub history: bool,
    pub iprompt: bool,
    pub profile: bool,
    pub prof_file: String,
    pub mprofile: bool,
    pub mprof_file: String,
    pub exe_log: bool,
    pub exe_log_file: String,
    /// Simulated clock cycle, picoseconds.
    pub clkcycle_ps: u32,
    pub strict_npc: bool,
    /// Suppress the per-instruction trace.
    pub hush: bool,
    /// Trace with physical rather than virtual addresses.
    pub trace_phys: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            verbose: false,
            quiet: false,
            report_mem_errs: false,
            history: false,
            iprompt: false,
            profile: false,
            prof_file: "sim.profile".to_string(),
            mprofile: false,
            mprof_file: "sim.mprofile".to_string(),
            exe_log: false,
            exe_log_file: "executed.log".to_string(),
            clkcycle_ps: 4000,
            strict_npc: false,
            hush: true,
            trace_phys: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CpuConfig {
    pub ver: u32,
    pub rev: u32,
    pub sbuf_len: usize,
    pub hardfloat: bool,
    /// Arithmetic instructions also set the flag on a zero result.
    pub arith_flag: bool,
}

impl Default for CpuConfig {
    fn default() -> Self {
        CpuConfig {
            ver: 0x12,
            rev: 0x01,
            sbuf_len: 0,
            hardfloat: false,
            arith_flag: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    Unmodified,
    Zero,
    Pattern,
    Random,
}

#[derive(Debug, Clone)]
pub struct MemoryConfig {
    pub name: String,
    pub kind: MemoryKind,
    pub baseaddr: u32,
    pub size: u32,
    pub delayr: i64,
    pub delayw: i64,
    pub pattern: u8,
    pub random_seed: u32,
    pub readonly: bool,
    pub mc: bool,
    pub log: Option<String>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            name: "anonymous memory block".to_string(),
            kind: MemoryKind::Unmodified,
            baseaddr: 0,
            size: 1024,
            delayr: 1,
            delayw: 1,
            pattern: 0,
            random_seed: 0x12345678,
            readonly: false,
            mc: false,
            log: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub nsets: usize,
    pub nways: usize,
    pub blocksize: usize,
    pub ustates: u32,
    pub hitdelay: i64,
    pub missdelay: i64,
    pub load_hitdelay: i64,
    pub load_missdelay: i64,
    pub store_hitdelay: i64,
    pub store_missdelay: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            enabled: false,
            nsets: 512,
            nways: 1,
            blocksize: 16,
            ustates: 2,
            hitdelay: 1,
            missdelay: 1,
            load_hitdelay: 2,
            load_missdelay: 100,
            store_hitdelay: 0,
            store_missdelay: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MmuConfig {
    pub enabled: bool,
    pub nsets: usize,
    pub nways: usize,
    pub pagesize: u32,
    pub entrysize: u32,
    pub ustates: u32,
    pub hitdelay: i64,
    pub missdelay: i64,
}

impl Default for MmuConfig {
    fn default() -> Self {
        MmuConfig {
            enabled: false,
            nsets: 1,
            nways: 1,
            pagesize: 8192,
            entrysize: 1,
            ustates: 2,
            hitdelay: 1,
            missdelay: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PicConfig {
    pub enabled: bool,
    pub edge_trigger: bool,
    pub use_nmi: bool,
}

impl Default for PicConfig {
    fn default() -> Self {
        PicConfig {
            enabled: true,
            edge_trigger: true,
            use_nmi: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PmConfig {
    pub enabled: bool,
}

/// Branch prediction section: parsed for compatibility, the predictor only
/// feeds statistics.
#[derive(Debug, Clone, Default)]
pub struct BpbConfig {
    pub enabled: bool,
    pub btic: bool,
    pub hitdelay: i64,
    pub missdelay: i64,
}

#[derive(Debug, Clone)]
pub struct DebugConfig {
    pub enabled: bool,
    pub rsp_enabled: bool,
    pub rsp_port: u16,
}

impl Default for DebugConfig {
    fn default() -> Self {
        DebugConfig {
            enabled: false,
            rsp_enabled: false,
            rsp_port: 51000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TickConfig {
    pub enabled: bool,
}

impl Default for TickConfig {
    fn default() -> Self {
        TickConfig { enabled: true }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub sim: SimConfig,
    pub cpu: CpuConfig,
    pub memories: Vec<MemoryConfig>,
    pub ic: CacheConfig,
    pub dc: CacheConfig,
    pub immu: MmuConfig,
    pub dmmu: MmuConfig,
    pub pic: PicConfig,
    pub pm: PmConfig,
    pub bpb: BpbConfig,
    pub debug: DebugConfig,
    pub tick: TickConfig,
}

/* ---------------------------------------------------------------------- */
/* Parsing                                                                 */
/* ---------------------------------------------------------------------- */

fn strip_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut in_comment = false;
    while let Some(c) = chars.next() {
        if in_comment {
            if c == '*' && chars.peek() == Some(&'/') {
                chars.next();
                in_comment = false;
            } else if c == '\n' {
                out.push('\n'); // keep line numbers stable
            }
        } else if c == '/' && chars.peek() == Some(&'*') {
            chars.next();
            in_comment = true;
        } else {
            out.push(c);
        }
    }
    out
}

/// Split one line into words; double-quoted strings may contain spaces.
fn tokenize(line: &str) -> Vec<String> {
    let mut toks = Vec::new();
    let mut chars = line.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '"' {
            chars.next();
            let mut s = String::new();
            for c in chars.by_ref() {
                if c == '"' {
                    break;
                }
                s.push(c);
            }
            toks.push(s);
        } else if c == '=' {
            chars.next(); // '=' between key and value is decoration
        } else {
            let mut s = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() || c == '=' {
                    break;
                }
                s.push(c);
                chars.next();
            }
            toks.push(s);
        }
    }
    toks
}

fn parse_int(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    parse_int(s).map(|v| v != 0)
}

/// Parse a clock cycle time like `10ns`, `4000ps`, `1us` into picoseconds.
fn parse_clkcycle(s: &str) -> Option<u32> {
    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
    let unit = &s[digits.len()..];
    let n: u64 = digits.parse().ok()?;
    let scale = match unit {
        "ps" | "" => 1,
        "ns" => 1_000,
        "us" => 1_000_000,
        "ms" => 1_000_000_000,
        _ => return None,
    };
    Some((n * scale) as u32)
}

struct LineError;

impl Config {
    pub fn load(path: &str) -> Result<Config, String> {
        let text =
            fs::read_to_string(path).map_err(|e| format!("cannot open config file {path}: {e}"))?;
        Self::parse(&text, path)
    }

    pub fn parse(text: &str, file: &str) -> Result<Config, String> {
        let mut config = Config::default();
        let text = strip_comments(text);
        let mut section: Option<String> = None;

        for (lineno, line) in text.lines().enumerate() {
            let toks = tokenize(line);
            if toks.is_empty() {
                continue;
            }
            match toks[0].as_str() {
                "section" => {
                    if toks.len() != 2 {
                        return Err(format!("{file}:{}: malformed section header", lineno + 1));
                    }
                    if section.is_some() {
                        return Err(format!("{file}:{}: nested section", lineno + 1));
                    }
                    let name = toks[1].clone();
                    if name == "memory" {
                        config.memories.push(MemoryConfig::default());
                    }
                    section = Some(name);
                }
                "end" => {
                    if section.take().is_none() {
                        return Err(format!("{file}:{}: end outside a section", lineno + 1));
                    }
                }
                key => {
                    let Some(sec) = section.as_deref() else {
                        return Err(format!(
                            "{file}:{}: parameter {key} outside a section",
                            lineno + 1
                        ));
                    };
                    let value = toks.get(1).map(String::as_str).unwrap_or("");
                    if config.apply(sec, key, value).is_err() {
                        warn!(
                            "{file}:{}: unknown parameter {key} in section {sec}: ignored",
                            lineno + 1
                        );
                    }
                }
            }
        }
        if section.is_some() {
            return Err(format!("{file}: unterminated section at end of file"));
        }
        Ok(config)
    }

    fn apply(&mut self, section: &str, key: &str, value: &str) -> Result<(), LineError> {
        let int = || parse_int(value).ok_or(LineError);
        let boolean = || parse_bool(value).ok_or(LineError);
        match section {
            "sim" => match key {
                "verbose" => self.sim.verbose = boolean()?,
                "quiet" => self.sim.quiet = boolean()?,
                "report_mem_errs" => self.sim.report_mem_errs = boolean()?,
                "history" => self.sim.history = boolean()?,
                "iprompt" => self.sim.iprompt = boolean()?,
                "profile" => self.sim.profile = boolean()?,
                "prof_file" | "prof_fn" => self.sim.prof_file = value.to_string(),
                "mprofile" => self.sim.mprofile = boolean()?,
                "mprof_file" | "mprof_fn" => self.sim.mprof_file = value.to_string(),
                "exe_log" => self.sim.exe_log = boolean()?,
                "exe_log_file" | "exe_log_fn" => self.sim.exe_log_file = value.to_string(),
                "clkcycle" => {
                    self.sim.clkcycle_ps = parse_clkcycle(value).ok_or(LineError)?;
                }
                "strict_npc" => self.sim.strict_npc = boolean()?,
                "hush" => self.sim.hush = boolean()?,
                _ => return Err(LineError),
            },
            "cpu" => match key {
                "ver" => self.cpu.ver = int()? as u32,
                "rev" => self.cpu.rev = int()? as u32,
                "sbuf_len" => self.cpu.sbuf_len = int()? as usize,
                "hardfloat" => self.cpu.hardfloat = boolean()?,
                "arith_flag" => self.cpu.arith_flag = boolean()?,
                _ => return Err(LineError),
            },
            "memory" => {
                let mem = self.memories.last_mut().ok_or(LineError)?;
                match key {
                    "name" => mem.name = value.to_string(),
                    "type" => {
                        mem.kind = match value {
                            "unmodified" | "unknown" => MemoryKind::Unmodified,
                            "zero" => MemoryKind::Zero,
                            "pattern" => MemoryKind::Pattern,
                            "random" => MemoryKind::Random,
                            _ => return Err(LineError),
                        }
                    }
                    "baseaddr" => mem.baseaddr = int()? as u32,
                    "size" => mem.size = int()? as u32,
                    "delayr" => mem.delayr = int()? as i64,
                    "delayw" => mem.delayw = int()? as i64,
                    "pattern" => mem.pattern = int()? as u8,
                    "random_seed" => mem.random_seed = int()? as u32,
                    "ro" => mem.readonly = boolean()?,
                    "mc" => mem.mc = boolean()?,
                    "log" => mem.log = Some(value.to_string()),
                    _ => return Err(LineError),
                }
            }
            "ic" | "dc" => {
                let cache = if section == "ic" { &mut self.ic } else { &mut self.dc };
                match key {
                    "enabled" => cache.enabled = boolean()?,
                    "nsets" => cache.nsets = int()? as usize,
                    "nways" => cache.nways = int()? as usize,
                    "blocksize" => cache.blocksize = int()? as usize,
                    "ustates" => cache.ustates = int()? as u32,
                    "hitdelay" => cache.hitdelay = int()? as i64,
                    "missdelay" => cache.missdelay = int()? as i64,
                    "load_hitdelay" => cache.load_hitdelay = int()? as i64,
                    "load_missdelay" => cache.load_missdelay = int()? as i64,
                    "store_hitdelay" => cache.store_hitdelay = int()? as i64,
                    "store_missdelay" => cache.store_missdelay = int()? as i64,
                    _ => return Err(LineError),
                }
            }
            "immu" | "dmmu" => {
                let mmu = if section == "immu" {
                    &mut self.immu
                } else {
                    &mut self.dmmu
                };
                match key {
                    "enabled" => mmu.enabled = boolean()?,
                    "nsets" => mmu.nsets = int()? as usize,
                    "nways" => mmu.nways = int()? as usize,
                    "pagesize" => mmu.pagesize = int()? as u32,
                    "entrysize" => mmu.entrysize = int()? as u32,
                    "ustates" => mmu.ustates = int()? as u32,
                    "hitdelay" => mmu.hitdelay = int()? as i64,
                    "missdelay" => mmu.missdelay = int()? as i64,
                    _ => return Err(LineError),
                }
            }
            "pic" => match key {
                "enabled" => self.pic.enabled = boolean()?,
                "edge_trigger" => self.pic.edge_trigger = boolean()?,
                "use_nmi" => self.pic.use_nmi = boolean()?,
                _ => return Err(LineError),
            },
            "pm" => match key {
                "enabled" => self.pm.enabled = boolean()?,
                _ => return Err(LineError),
            },
            "bpb" => match key {
                "enabled" => self.bpb.enabled = boolean()?,
                "btic" => self.bpb.btic = boolean()?,
                "hitdelay" => self.bpb.hitdelay = int()? as i64,
                "missdelay" => self.bpb.missdelay = int()? as i64,
                "sbp_bnf_fwd" | "sbp_bf_fwd" => (),
                _ => return Err(LineError),
            },
            "debug" => match key {
                "enabled" => self.debug.enabled = boolean()?,
                "rsp_enabled" => self.debug.rsp_enabled = boolean()?,
                "rsp_port" => self.debug.rsp_port = int()? as u16,
                _ => return Err(LineError),
            },
            "tick" => match key {
                "enabled" => self.tick.enabled = boolean()?,
                _ => return Err(LineError),
            },
            _ => {
                // unknown section: every key in it is skipped with a warning
                warn!("unknown section {section}: parameter {key} skipped");
            }
        }
        Ok(())
    }

    /// Runtime `set <section> <key> <value>` from the monitor.
    pub fn set_param(&mut self, section: &str, key: &str, value: &str) -> bool {
        self.apply(section, key, value).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_representative_file() {
        let text = r#"
/* a typical simulation script */
section sim
  verbose = 1
  clkcycle 100ns
end

section memory
  name = "Main RAM"
  type random
  baseaddr = 0x00000000
  size     = 0x00200000
  delayr = 2
  delayw = 4
end

section dc
  enabled = 1
  nsets = 4
  nways = 1
  blocksize = 16
end

section debug
  enabled = 1
  rsp_enabled = 1
  rsp_port = 51000
end
"#;
        let c = Config::parse(text, "test.cfg").unwrap();
        assert!(c.sim.verbose);
        assert_eq!(c.sim.clkcycle_ps, 100_000);
        assert_eq!(c.memories.len(), 1);
        assert_eq!(c.memories[0].name, "Main RAM");
        assert_eq!(c.memories[0].kind, MemoryKind::Random);
        assert_eq!(c.memories[0].size, 0x0020_0000);
        assert_eq!(c.memories[0].delayr, 2);
        assert!(c.dc.enabled);
        assert_eq!(c.dc.nsets, 4);
        assert!(c.debug.rsp_enabled);
        assert_eq!(c.debug.rsp_port, 51000);
    }

    #[test]
    fn unknown_keys_and_sections_are_skipped() {
        let text = r#"
section sim
  no_such_key = 77
  verbose = 1
end
section uart
  baseaddr = 0x90000000
end
"#;
        let c = Config::parse(text, "test.cfg").unwrap();
        assert!(c.sim.verbose);
    }

    #[test]
    fn comments_may_span_lines() {
        let text = "section sim\n/* verbose = 1\n   still comment */ quiet = 1\nend\n";
        let c = Config::parse(text, "t").unwrap();
        assert!(!c.sim.verbose);
        assert!(c.sim.quiet);
    }

    #[test]
    fn structural_errors_are_fatal() {
        assert!(Config::parse("section sim\n", "t").is_err());
        assert!(Config::parse("end\n", "t").is_err());
        assert!(Config::parse("verbose 1\n", "t").is_err());
    }

    #[test]
    fn two_memory_sections_become_two_regions() {
        let text = "section memory\nbaseaddr = 0\nsize = 0x1000\nend\nsection memory\nbaseaddr = 0xf0000000\nsize = 0x1000\nend\n";
        let c = Config::parse(text, "t").unwrap();
        assert_eq!(c.memories.len(), 2);
        assert_eq!(c.memories[1].baseaddr, 0xf000_0000);
    }
}
