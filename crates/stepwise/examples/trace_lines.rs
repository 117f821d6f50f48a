//! Launch a program and single-step it line by line.
//!
//! Prints every stop of `next_line` from the entry function until the
//! program exits or the step budget runs out. Logs go to a file so they do
//! not mix with the target's output.
//!
//! ```bash
//! cargo run --example trace_lines -- ./target/debug/examples/hello_target main 20
//! ```

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
fn main()
{
    eprintln!("This example needs Linux on x86-64.");
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn main()
{
    use stepwise_core::breakpoints::BreakpointBuilder;
    use stepwise_core::config::{DebuggerOptions, LaunchOptions};
    use stepwise_core::Process;
    use stepwise_utils::{init_logging_to_file, LogFormat};

    let mut args = std::env::args().skip(1);
    let Some(program) = args.next() else {
        eprintln!("usage: trace_lines <program> [function] [steps]");
        std::process::exit(2);
    };
    let function = args.next().unwrap_or_else(|| "main".to_string());
    let steps: usize = args.next().and_then(|s| s.parse().ok()).unwrap_or(20);

    let guard = init_logging_to_file(None, None, LogFormat::Pretty).expect("Failed to initialize logging");
    if let Some(file) = guard.file() {
        eprintln!("logging to {}", file.display());
    }

    let process = Process::launch(&LaunchOptions::new(program), DebuggerOptions::from_env()).expect("launch failed");
    let thread = process.main_thread().expect("no main thread");

    let Some(method) = process.symbols().lookup_by_name(&function) else {
        eprintln!("no function named {function}");
        process.kill().expect("kill failed");
        return;
    };
    thread
        .insert_breakpoint(BreakpointBuilder::new(method.body_start()))
        .expect("cannot set breakpoint");

    let event = thread.continue_execution().expect("continue failed").wait().expect("continue failed");
    println!("{}", event.describe());

    for _ in 0..steps {
        let event = thread.next_line().expect("step failed").wait().expect("step failed");
        match event.frame() {
            Some(frame) => match &frame.source {
                Some(source) => println!("{source}"),
                None => println!("{frame}"),
            },
            None => println!("{}", event.describe()),
        }
        if event.is_terminal() {
            return;
        }
    }
    process.kill().expect("kill failed");
}
