//! Debugger configuration.
//!
//! [`DebuggerOptions`] tunes the event loop and the stepping engine;
//! [`LaunchOptions`] describes a program to spawn. Options can be built in
//! code or read from `STEPWISE_*` environment variables.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

/// Event loop and engine tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebuggerOptions
{
    /// How long the event loop waits for a target event before looking at
    /// the command queue again while some thread is running.
    pub poll_interval: Duration,
    /// Upper bound on backtrace depth.
    pub max_backtrace_frames: usize,
    /// Spawn targets with address-space randomisation disabled.
    pub disable_aslr: bool,
    /// Step into every call as if the callee had source. Debugging aid.
    pub step_into_without_source: bool,
    /// Recognise kernel signal-return frames while unwinding.
    pub sigreturn_unwinding: bool,
}

impl Default for DebuggerOptions
{
    fn default() -> Self
    {
        Self {
            poll_interval: Duration::from_millis(10),
            max_backtrace_frames: 256,
            disable_aslr: true,
            step_into_without_source: false,
            sigreturn_unwinding: true,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T>
{
    let value = env::var(name).ok()?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(variable = name, value = %value, "ignoring unparsable environment variable");
            None
        }
    }
}

fn env_flag(name: &str) -> Option<bool>
{
    let value = env::var(name).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!(variable = name, value = %value, "ignoring unparsable boolean");
            None
        }
    }
}

impl DebuggerOptions
{
    /// Defaults overridden by `STEPWISE_POLL_INTERVAL_MS`,
    /// `STEPWISE_MAX_FRAMES` and `STEPWISE_DISABLE_ASLR`.
    #[must_use]
    pub fn from_env() -> Self
    {
        let mut options = Self::default();
        if let Some(ms) = env_parse::<u64>("STEPWISE_POLL_INTERVAL_MS") {
            options.poll_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(frames) = env_parse::<usize>("STEPWISE_MAX_FRAMES") {
            options.max_backtrace_frames = frames.max(1);
        }
        if let Some(disable) = env_flag("STEPWISE_DISABLE_ASLR") {
            options.disable_aslr = disable;
        }
        options
    }

    /// Set the poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self
    {
        self.poll_interval = interval;
        self
    }

    /// Set the backtrace depth limit.
    #[must_use]
    pub fn with_max_backtrace_frames(mut self, frames: usize) -> Self
    {
        self.max_backtrace_frames = frames;
        self
    }

    /// Enable or disable ASLR for spawned targets.
    #[must_use]
    pub fn with_disable_aslr(mut self, disable: bool) -> Self
    {
        self.disable_aslr = disable;
        self
    }

    /// Step into calls regardless of source availability.
    #[must_use]
    pub fn with_step_into_without_source(mut self, enabled: bool) -> Self
    {
        self.step_into_without_source = enabled;
        self
    }

    /// Enable or disable signal-frame unwinding.
    #[must_use]
    pub fn with_sigreturn_unwinding(mut self, enabled: bool) -> Self
    {
        self.sigreturn_unwinding = enabled;
        self
    }
}

/// A program to start under the debugger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOptions
{
    /// Executable path.
    pub program: PathBuf,
    /// Arguments, without the program name.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Working directory; the debugger's own if `None`.
    pub cwd: Option<PathBuf>,
}

impl LaunchOptions
{
    /// Launch `program` with no arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self
    {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
        }
    }

    /// Append arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self
    {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self
    {
        self.cwd = Some(cwd.into());
        self
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_builder_methods()
    {
        let options = DebuggerOptions::default()
            .with_poll_interval(Duration::from_millis(3))
            .with_max_backtrace_frames(8)
            .with_disable_aslr(false);
        assert_eq!(options.poll_interval, Duration::from_millis(3));
        assert_eq!(options.max_backtrace_frames, 8);
        assert!(!options.disable_aslr);
        assert!(options.sigreturn_unwinding);
    }

    #[test]
    fn test_launch_options()
    {
        let launch = LaunchOptions::new("/bin/true").args(["-x", "y"]).env("A", "1").cwd("/tmp");
        assert_eq!(launch.args, vec!["-x".to_string(), "y".to_string()]);
        assert_eq!(launch.env, vec![("A".to_string(), "1".to_string())]);
        assert_eq!(launch.cwd, Some(PathBuf::from("/tmp")));
    }
}
