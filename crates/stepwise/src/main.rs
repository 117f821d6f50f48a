use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::{Parser, Subcommand};
use stepwise_core::config::{DebuggerOptions, LaunchOptions};
use stepwise_core::types::ProcessId;
use stepwise_core::Process;
use stepwise_utils::{init_logging, init_logging_to_file, init_logging_with_level, LogFormat, LogLevel, LoggingGuard};
use tracing::info;

mod commands;
mod session;

use session::Session;

/// A native debugger built around per-thread stepping engines.
#[derive(Parser, Debug)]
#[command(name = "stepwise")]
#[command(version)]
#[command(about = "A native debugger built around per-thread stepping engines", long_about = None)]
struct Cli
{
    #[command(subcommand)]
    command: Commands,

    /// Log level; overrides RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    /// Log format (pretty or json); overrides STEPWISE_LOG_FORMAT
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    /// Log only to this file (rotated daily), keeping the terminal for the target
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Event loop poll interval in milliseconds
    #[arg(long, global = true)]
    poll_interval_ms: Option<u64>,

    /// Maximum backtrace depth
    #[arg(long, global = true)]
    max_frames: Option<usize>,

    /// Keep address-space randomisation enabled for launched programs
    #[arg(long, global = true, default_value_t = false)]
    keep_aslr: bool,

    /// Step into every call, even into code without source
    #[arg(long, global = true, default_value_t = false)]
    step_into_without_source: bool,
}

#[derive(Subcommand, Debug)]
enum Commands
{
    /// Launch a new process under debugger control
    Launch
    {
        /// Path to the executable to launch
        program: PathBuf,
        /// Arguments to pass to the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
        /// Working directory of the program
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// Extra environment variable, as KEY=VALUE
        #[arg(long = "env", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,
    },
    /// Attach to a running process by PID
    Attach
    {
        /// Process ID (PID) to attach to
        pid: u32,
    },
}

fn parse_env_pair(text: &str) -> Result<(String, String), String>
{
    text.split_once('=')
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{text}'"))
}

impl Cli
{
    /// Environment defaults with the command-line flags on top.
    fn debugger_options(&self) -> DebuggerOptions
    {
        let mut options = DebuggerOptions::from_env();
        if let Some(ms) = self.poll_interval_ms {
            options = options.with_poll_interval(Duration::from_millis(ms.max(1)));
        }
        if let Some(frames) = self.max_frames {
            options = options.with_max_backtrace_frames(frames.max(1));
        }
        if self.keep_aslr {
            options = options.with_disable_aslr(false);
        }
        if self.step_into_without_source {
            options = options.with_step_into_without_source(true);
        }
        options
    }

    fn init_logging(&self) -> Result<LoggingGuard, stepwise_utils::LoggingError>
    {
        let format = self.log_format.unwrap_or(LogFormat::Pretty);
        match (&self.log_file, self.log_level) {
            (Some(path), level) => init_logging_to_file(Some(path.clone()), level, format),
            (None, Some(level)) => init_logging_with_level(level, format),
            (None, None) if self.log_format.is_some() => init_logging_with_level(LogLevel::Info, format),
            (None, None) => init_logging(),
        }
    }
}

fn main()
{
    let cli = Cli::parse();

    let _guard = match cli.init_logging() {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>>
{
    let options = cli.debugger_options();
    let (process, attached) = match cli.command {
        Commands::Launch {
            program,
            args,
            cwd,
            env,
        } => {
            let program = if program.is_absolute() {
                program
            } else {
                std::env::current_dir()?.join(program).canonicalize()?
            };
            let mut launch = LaunchOptions::new(program).args(args);
            launch.env = env;
            launch.cwd = cwd;
            info!(program = %launch.program.display(), args = ?launch.args, "launching");
            let process = launch_process(&launch, options)?;
            println!("Launched {} (PID: {})", launch.program.display(), process.pid());
            (process, false)
        }
        Commands::Attach { pid } => {
            info!(pid, "attaching");
            let process = attach_process(ProcessId::from(pid), options)?;
            println!("Attached to process {pid} ({} threads)", process.threads().len());
            (process, true)
        }
    };

    let session = Session::new(process, attached)?;
    session.run(std::io::stdin().lock())?;
    Ok(())
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn launch_process(launch: &LaunchOptions, options: DebuggerOptions) -> stepwise_core::Result<Process>
{
    Process::launch(launch, options)
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn attach_process(pid: ProcessId, options: DebuggerOptions) -> stepwise_core::Result<Process>
{
    Process::attach(pid, options)
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
fn launch_process(_launch: &LaunchOptions, _options: DebuggerOptions) -> stepwise_core::Result<Process>
{
    Err(stepwise_core::StepwiseError::CannotStartTarget(
        "live targets need Linux on x86-64".to_string(),
    ))
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
fn attach_process(_pid: ProcessId, _options: DebuggerOptions) -> stepwise_core::Result<Process>
{
    Err(stepwise_core::StepwiseError::CannotStartTarget(
        "live targets need Linux on x86-64".to_string(),
    ))
}
