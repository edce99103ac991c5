use std::sync::atomic::Ordering;

use build_time::build_time_utc;
use clap::Parser;
use tracing::{info, warn};

use crate::core::config::{Config, MemoryConfig};
use crate::core::emu::{Simulator, CTRLC_PENDING};

mod core;
mod log;

pub const SIM_NAME: &str = "r-or1k";
pub const SIM_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const SIM_BUILD_DATE_TIME: &str = build_time_utc!();

#[derive(Parser)]
#[command(
    name = SIM_NAME,
    about = "OpenRISC 1000 architectural simulator",
    disable_version_flag = true
)]
struct Args {
    /// Print version information and exit
    #[arg(long)]
    version: bool,

    /// Configuration file
    #[arg(short = 'f', long = "file", value_name = "FILE")]
    config: Option<String>,

    /// Do not launch the RSP debug server
    #[arg(long)]
    nosrv: bool,

    /// Launch the RSP debug server, optionally on a fixed port
    #[arg(long, value_name = "PORT", num_args = 0..=1, default_missing_value = "0")]
    srv: Option<u16>,

    /// Add a default RAM region of the given size (g/m/k suffixes accepted)
    #[arg(short = 'm', value_name = "SIZE")]
    memory: Option<String>,

    /// Debug channel specification for the logger
    #[arg(short = 'd', value_name = "SPEC")]
    debug_channels: Option<String>,

    /// Drop into the interactive prompt
    #[arg(short = 'i', long = "interactive")]
    interactive: bool,

    /// Minimal output
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Verbose output
    #[arg(short = 'V', long)]
    verbose: bool,

    /// Per-instruction execution trace
    #[arg(short = 't')]
    trace: bool,

    /// Trace using physical addresses
    #[arg(long)]
    trace_physical: bool,

    /// Trace using virtual addresses
    #[arg(long)]
    trace_virtual: bool,

    /// Report accesses to unmapped memory
    #[arg(long)]
    report_memory_errors: bool,

    /// NPC reads return zero while it is invalid during a stall
    #[arg(long)]
    strict_npc: bool,

    /// Enable function profiling
    #[arg(long)]
    enable_profile: bool,

    /// Enable memory profiling
    #[arg(long)]
    enable_mprofile: bool,

    /// Program image to load (ELF or COFF)
    executable: Option<String>,
}

/// Parse a memory size with optional g/m/k suffix.
fn parse_mem_size(s: &str) -> Option<u32> {
    let s = s.trim().to_lowercase();
    let (digits, scale) = match s.chars().last()? {
        'g' => (&s[..s.len() - 1], 1 << 30),
        'm' => (&s[..s.len() - 1], 1 << 20),
        'k' => (&s[..s.len() - 1], 1 << 10),
        _ => (&s[..], 1),
    };
    let n: u64 = digits.parse().ok()?;
    u32::try_from(n * scale).ok()
}

fn run() -> i32 {
    let args = Args::parse();

    if args.version {
        println!("{SIM_NAME} {SIM_VERSION} (built {SIM_BUILD_DATE_TIME})");
        return 0;
    }

    let level = if let Some(spec) = &args.debug_channels {
        spec.clone()
    } else if args.quiet {
        "error".to_string()
    } else if args.verbose {
        "debug".to_string()
    } else {
        "info".to_string()
    };
    let logger = log::Logger::new(&level);

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("ERROR: {e}");
                return 1;
            }
        },
        None => Config::default(),
    };

    // Command line overrides on top of the file.
    if args.quiet {
        config.sim.quiet = true;
    }
    if args.verbose {
        config.sim.verbose = true;
    }
    if args.interactive {
        config.sim.iprompt = true;
    }
    if args.trace || args.trace_physical || args.trace_virtual {
        config.sim.hush = false;
        config.sim.trace_phys = args.trace_physical;
    }
    if args.report_memory_errors {
        config.sim.report_mem_errs = true;
    }
    if args.strict_npc {
        config.sim.strict_npc = true;
    }
    if args.enable_profile {
        config.sim.profile = true;
    }
    if args.enable_mprofile {
        config.sim.mprofile = true;
    }
    if let Some(size) = &args.memory {
        let Some(size) = parse_mem_size(size) else {
            eprintln!("ERROR: bad memory size {size}");
            return 1;
        };
        config.memories.push(MemoryConfig {
            name: "default RAM".to_string(),
            size,
            ..Default::default()
        });
    }
    if args.nosrv {
        config.debug.rsp_enabled = false;
    } else if let Some(port) = args.srv {
        config.debug.enabled = true;
        config.debug.rsp_enabled = true;
        config.debug.rsp_port = if port != 0 {
            port
        } else {
            // no port given: choose a random high one
            40000 + (std::process::id() % 20000) as u16
        };
    }

    if config.memories.is_empty() {
        warn!("no memory configured: adding 16 MiB of RAM at 0");
        config.memories.push(MemoryConfig {
            name: "default RAM".to_string(),
            size: 16 << 20,
            ..Default::default()
        });
    }

    let mut sim = match Simulator::new(config) {
        Ok(sim) => sim,
        Err(e) => {
            eprintln!("ERROR: {e}");
            return 1;
        }
    };
    sim.logger = Some(logger);

    if !sim.config.sim.quiet {
        println!("{SIM_NAME} {SIM_VERSION} (built {SIM_BUILD_DATE_TIME})");
    }

    if let Some(path) = &args.executable {
        if let Err(e) = sim.load_object(path) {
            eprintln!("ERROR: {e}");
            return 1;
        }
    }

    if let Err(e) = ctrlc::set_handler(|| {
        CTRLC_PENDING.fetch_add(1, Ordering::SeqCst);
    }) {
        warn!("cannot install ctrl-C handler: {e}");
    }

    info!("starting simulation");
    sim.exec_main();

    // Normal termination, whatever the simulated program reported.
    0
}

fn main() {
    std::process::exit(run());
}
