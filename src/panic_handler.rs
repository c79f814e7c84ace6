use log::error;
use std::panic;

/// Install the process-wide panic hook.
///
/// A panic on any thread, the render worker included, is an invariant
/// violation: it is logged, reported with a readable backtrace and ends the
/// process.
pub fn initialize_panic_handler() {
    better_panic::install();

    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let thread = std::thread::current();
        error!(
            "Panic on thread {}: {panic_info}",
            thread.name().unwrap_or("<unnamed>")
        );
        log::logger().flush();

        default_hook(panic_info);

        std::process::exit(1);
    }));
}
