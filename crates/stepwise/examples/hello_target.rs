//! Small target program for trying out the debugger.
//!
//! It prints its PID, then counts forever through a couple of ordinary
//! functions, so there is something to step into and out of:
//!
//! ```bash
//! cargo run --example hello_target
//! stepwise attach <PID>
//! ```

#[inline(never)]
fn bump(counter: u64) -> u64
{
    let next = counter.wrapping_add(1);
    std::hint::black_box(next)
}

#[inline(never)]
fn report(counter: u64)
{
    if counter % 5 == 0 {
        println!("counter = {counter}");
    }
}

fn main()
{
    let pid = std::process::id();
    println!("Hello! I am process {pid}");
    println!("Waiting for a debugger to attach... (Press Ctrl+C to exit)");

    let mut counter = 0;
    loop {
        counter = bump(counter);
        report(counter);
        std::thread::sleep(std::time::Duration::from_millis(200));
    }
}
