use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use kernel::KernelConfig;
use machine::{Machine, MachineConfig, MemoryMode, SchedulerChoice};
use memory::{AllocStrategy, EvictPolicy, FetchPolicy};

/// User-space RV32IM machine with a small multitasking kernel.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// ELF executable loaded as PID 1 (init)
    elf: PathBuf,

    /// Memory mode: contiguous or paged
    #[arg(long, default_value = "paged")]
    memory: String,

    /// Contiguous allocation strategy: first or best
    #[arg(long, default_value = "first")]
    strategy: String,

    /// Paged fetch policy: demand or eager
    #[arg(long, default_value = "demand")]
    fetch: String,

    /// Paged replacement policy: clock, lru or random
    #[arg(long, default_value = "clock")]
    evict: String,

    /// Scheduler: rr, priority or cooperative
    #[arg(long, default_value = "rr")]
    scheduler: String,

    /// Instructions per time slice (rr/priority)
    #[arg(long, default_value_t = 1000)]
    time_slice: usize,

    /// Number of simulated harts
    #[arg(long, default_value_t = 1)]
    harts: usize,

    /// Physical memory size in MiB
    #[arg(long, default_value_t = 64)]
    ram_mb: usize,
}

fn parse_config(args: &Args) -> Result<MachineConfig> {
    let memory = match args.memory.as_str() {
        "contiguous" => MemoryMode::Contiguous {
            strategy: match args.strategy.as_str() {
                "first" => AllocStrategy::FirstFit,
                "best" => AllocStrategy::BestFit,
                other => bail!("unknown strategy '{other}'"),
            },
        },
        "paged" => MemoryMode::Paged {
            fetch: match args.fetch.as_str() {
                "demand" => FetchPolicy::Demand,
                "eager" => FetchPolicy::Eager,
                other => bail!("unknown fetch policy '{other}'"),
            },
            evict: match args.evict.as_str() {
                "clock" => EvictPolicy::Clock,
                "lru" => EvictPolicy::Lru,
                "random" => EvictPolicy::Random,
                other => bail!("unknown replacement policy '{other}'"),
            },
        },
        other => bail!("unknown memory mode '{other}'"),
    };

    let scheduler = match args.scheduler.as_str() {
        "rr" => SchedulerChoice::RoundRobin { time_slice: args.time_slice },
        "priority" => SchedulerChoice::Priority { time_slice: args.time_slice },
        "cooperative" => SchedulerChoice::Cooperative,
        other => bail!("unknown scheduler '{other}'"),
    };

    Ok(MachineConfig {
        ram_bytes: args.ram_mb * 1024 * 1024,
        memory,
        scheduler,
        kernel: KernelConfig {
            hart_count: args.harts,
            ..KernelConfig::default()
        },
    })
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = parse_config(&args)?;

    let mut machine = Machine::new(config);
    let elf = args.elf.to_string_lossy().into_owned();
    let init = machine
        .boot(&elf)
        .with_context(|| format!("booting {}", elf))?;

    // Run until init exits; one hour is effectively "forever" here.
    let code = machine
        .wait_for_exit(&init, Duration::from_secs(3600))
        .context("init did not exit")?;
    machine.shutdown();
    std::process::exit(code & 0xff);
}
