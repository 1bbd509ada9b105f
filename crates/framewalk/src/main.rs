use std::error::Error;
use std::path::PathBuf;
use std::process;

use clap::{Args, Parser, Subcommand};
use framewalk_core::core_image::{CoreImage, CoreThread};
use framewalk_core::library::{LibraryDirectory, ProcMaps};
use framewalk_core::memory::{ProcessMemory, TargetMemory};
use framewalk_core::remote::{select_thread, CoreThreads};
use framewalk_core::symbols::Symbolizer;
use framewalk_core::{
    Address, Architecture, CfiFrameResolver, FallbackPolicy, FrameWalker, ProcessId, ThreadId, UnwindConfig,
};
use framewalk_utils::{debug, LogConfig, LogFormat, LogLevel, LoggingGuard};

type CliResult<T> = Result<T, Box<dyn Error>>;

/// Walk native call frames of a live process or a core image.
#[derive(Parser, Debug)]
#[command(name = "framewalk")]
#[command(version)]
#[command(about = "Walk native call frames of a live process or a core image", long_about = None)]
struct Cli
{
    /// Log level (overrides RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,
    /// Log format: pretty or json (overrides FRAMEWALK_LOG_FORMAT)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands
{
    /// Resolve the caller of a single frame through CFI
    Resolve
    {
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        registers: RegisterArgs,
        #[command(flatten)]
        unwind: UnwindArgs,
    },
    /// Walk the whole native call chain through CFI
    Walk
    {
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        registers: RegisterArgs,
        #[command(flatten)]
        unwind: UnwindArgs,
        /// Do not look up symbol names
        #[arg(long, default_value_t = false)]
        no_symbols: bool,
    },
    /// List the threads recorded in a core image
    Threads
    {
        /// Path to the core file
        #[arg(long)]
        core: PathBuf,
    },
    /// Walk the call chain with the system libunwind
    Remote
    {
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        registers: RegisterArgs,
        /// Maximum number of frames to print
        #[arg(long, default_value_t = framewalk_core::config::DEFAULT_MAX_FRAMES)]
        max_frames: usize,
    },
}

#[derive(Args, Debug)]
struct TargetArgs
{
    /// Process ID of a live (stopped) process
    #[arg(long, conflicts_with = "core", required_unless_present = "core")]
    pid: Option<u32>,
    /// Path to a core file
    #[arg(long)]
    core: Option<PathBuf>,
    /// Thread to unwind (defaults to the process's main thread, or the first
    /// thread recorded in the core)
    #[arg(long)]
    thread: Option<u64>,
}

/// Initial register values, hex (0x...) or decimal
#[derive(Args, Debug)]
struct RegisterArgs
{
    #[arg(long, value_parser = parse_number)]
    ip: Option<u64>,
    #[arg(long, value_parser = parse_number)]
    sp: Option<u64>,
    #[arg(long, value_parser = parse_number)]
    bp: Option<u64>,
}

#[derive(Args, Debug)]
struct UnwindArgs
{
    /// Target architecture (x86_64 or aarch64); taken from the core when omitted
    #[arg(long)]
    arch: Option<Architecture>,
    /// Maximum number of frames to walk
    #[arg(long, default_value_t = framewalk_core::config::DEFAULT_MAX_FRAMES)]
    max_frames: usize,
    /// Fail instead of following the frame-pointer chain when no CFI covers an address
    #[arg(long, default_value_t = false)]
    no_fallback: bool,
}

fn parse_number(s: &str) -> Result<u64, String>
{
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|err| format!("invalid number {s}: {err}"))
}

/// Memory, libraries and initial registers of the thread being unwound.
enum Target
{
    Live
    {
        memory: ProcessMemory,
        maps: ProcMaps,
        thread: ThreadId,
    },
    Core(Box<CoreImage>),
}

impl Target
{
    fn open(args: &TargetArgs) -> CliResult<Self>
    {
        if let Some(path) = &args.core {
            let mut core = CoreImage::open(path)?;
            if let Some(thread) = args.thread {
                select_thread(&mut core, ThreadId(thread))?;
            }
            return Ok(Target::Core(Box::new(core)));
        }

        let pid = args.pid.ok_or("either --pid or --core is required")?;
        let pid = ProcessId::from(pid);
        Ok(Target::Live {
            memory: ProcessMemory::open(pid)?,
            maps: ProcMaps::read(pid)?,
            thread: args.thread.map_or(ThreadId(u64::from(pid.0)), ThreadId),
        })
    }

    fn memory(&self) -> &dyn TargetMemory
    {
        match self {
            Target::Live { memory, .. } => memory,
            Target::Core(core) => core.as_ref(),
        }
    }

    fn libraries(&self) -> &dyn LibraryDirectory
    {
        match self {
            Target::Live { maps, .. } => maps,
            Target::Core(core) => core.as_ref(),
        }
    }

    fn thread(&self) -> Option<ThreadId>
    {
        match self {
            Target::Live { thread, .. } => Some(*thread),
            Target::Core(core) => core.selected_thread_id(),
        }
    }

    fn architecture(&self) -> Option<Architecture>
    {
        match self {
            Target::Live { .. } => None,
            Target::Core(core) => Some(core.architecture()),
        }
    }

    /// Flags win; a core supplies whatever the flags leave out.
    fn registers(&self, args: &RegisterArgs) -> CliResult<(Address, Address, Address)>
    {
        let recorded = match self {
            Target::Live { .. } => None,
            Target::Core(core) => core.selected().copied(),
        };
        let pick = |flag: Option<u64>, name: &str, from_core: fn(&CoreThread) -> Address| {
            flag.map(Address::from)
                .or_else(|| recorded.as_ref().map(from_core))
                .ok_or_else(|| format!("--{name} is required for a live process"))
        };
        Ok((
            pick(args.ip, "ip", |thread| thread.ip)?,
            pick(args.sp, "sp", |thread| thread.sp)?,
            pick(args.bp, "bp", |thread| thread.bp)?,
        ))
    }
}

fn unwind_config(args: &UnwindArgs, target: &Target) -> UnwindConfig
{
    let architecture = args
        .arch
        .or_else(|| target.architecture())
        .unwrap_or_else(Architecture::current);
    let fallback = if args.no_fallback {
        FallbackPolicy::Disabled
    } else {
        FallbackPolicy::FramePointer
    };
    UnwindConfig::default()
        .with_architecture(architecture)
        .with_max_frames(args.max_frames)
        .with_fallback(fallback)
}

/// Environment configuration with the command-line overrides applied
///
/// Without `--log-level` the level still comes from `RUST_LOG`.
fn log_config(cli: &Cli) -> CliResult<LogConfig>
{
    let mut config = LogConfig::from_env()?;
    if let Some(level) = cli.log_level {
        config = config.with_level(level);
    }
    if let Some(format) = cli.log_format {
        config = config.with_format(format);
    }
    Ok(config)
}

fn setup_logging(cli: &Cli) -> CliResult<LoggingGuard>
{
    Ok(log_config(cli)?.init()?)
}

fn main()
{
    let cli = Cli::parse();

    let _guard = match setup_logging(&cli) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = run_command(cli.command) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run_command(command: Commands) -> CliResult<()>
{
    match command {
        Commands::Resolve {
            target,
            registers,
            unwind,
        } => {
            let target = Target::open(&target)?;
            let config = unwind_config(&unwind, &target);
            let (ip, sp, bp) = target.registers(&registers)?;
            let library = target
                .libraries()
                .find_by_address(ip)
                .ok_or_else(|| format!("no native library contains {ip}"))?;
            debug!("resolving {ip} in {}", library.path().display());

            let resolver = CfiFrameResolver::new(target.memory(), config);
            let frame = resolver.resolve(&library, ip, bp, sp)?;
            println!("{frame} ({:?})", frame.source());
            if frame.is_terminal() {
                println!("outermost frame");
            }
            Ok(())
        }
        Commands::Walk {
            target,
            registers,
            unwind,
            no_symbols,
        } => {
            let target = Target::open(&target)?;
            let config = unwind_config(&unwind, &target);
            let (ip, sp, bp) = target.registers(&registers)?;

            let symbolizer = Symbolizer::new();
            let mut walker = FrameWalker::new(target.memory(), target.libraries(), config);
            if !no_symbols {
                walker = walker.with_symbolizer(&symbolizer);
            }
            let walk = walker.walk(ip, bp, sp);

            for (index, frame) in walk.frames.iter().enumerate() {
                let symbol = frame.symbol.as_ref().map_or_else(|| "??".to_string(), ToString::to_string);
                let library = frame
                    .library
                    .as_ref()
                    .map_or_else(|| "<unknown>".to_string(), |path| path.display().to_string());
                println!("#{index:<3} {} in {symbol} ({library}) sp={} bp={}", frame.ip, frame.sp, frame.bp);
            }
            println!("stopped: {}", walk.termination);
            Ok(())
        }
        Commands::Threads { core } => {
            let mut core = CoreImage::open(&core)?;
            println!("{} ({} threads)", core.architecture(), core.thread_count());
            for index in 0..core.thread_count() {
                core.select_thread(index)?;
                if let Some(thread) = core.selected() {
                    println!(
                        "[{index}] tid {} ip={} sp={} bp={}",
                        thread.id, thread.ip, thread.sp, thread.bp
                    );
                }
            }
            Ok(())
        }
        Commands::Remote {
            target,
            registers,
            max_frames,
        } => {
            let target = Target::open(&target)?;
            let (ip, sp, bp) = target.registers(&registers)?;
            run_remote(&target, ip, sp, bp, max_frames)
        }
    }
}

#[cfg(feature = "libunwind")]
fn run_remote(target: &Target, ip: Address, sp: Address, bp: Address, max_frames: usize) -> CliResult<()>
{
    use framewalk_core::remote::libunwind::Libunwind;
    use framewalk_core::remote::{RegisterShim, RemoteUnwindSession, UnwindTarget};

    let thread = target.thread().ok_or("no thread to unwind")?;
    let unwind_target = match target {
        Target::Live { .. } => UnwindTarget::LiveProcess { thread },
        Target::Core(core) => UnwindTarget::CoreImage {
            path: core.path().ok_or("core image has no path")?.to_path_buf(),
            thread,
        },
    };
    let shim = RegisterShim::new(ip.value(), sp.value(), bp.value());
    let mut session = RemoteUnwindSession::init(Libunwind, &unwind_target, shim, target.libraries())?;

    for index in 0..max_frames {
        let ip = session.instruction_pointer()?;
        let sp = session.stack_pointer()?;
        let bp = session.frame_pointer()?;
        println!("#{index:<3} {} sp={} bp={}", Address::from(ip), Address::from(sp), Address::from(bp));
        if !session.step()? {
            println!("stopped: reached outermost frame");
            return Ok(());
        }
    }
    println!("stopped: frame limit reached");
    Ok(())
}

#[cfg(not(feature = "libunwind"))]
fn run_remote(target: &Target, _ip: Address, _sp: Address, _bp: Address, _max_frames: usize) -> CliResult<()>
{
    debug!("remote unwind requested for thread {:?}", target.thread());
    Err("framewalk was built without the `libunwind` feature; rebuild with `--features libunwind`".into())
}
