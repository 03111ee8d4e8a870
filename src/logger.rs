use std::{
    fmt::Display,
    sync::atomic::{AtomicBool, Ordering::SeqCst},
    time::Instant,
};

static VERBOSE: AtomicBool = AtomicBool::new(false);

/// Enables the pipeline's stdout reporting (off by default so library
/// consumers and tests stay quiet).
pub fn set_verbose(val: bool) {
    VERBOSE.store(val, SeqCst)
}

pub fn verbose() -> bool {
    VERBOSE.load(SeqCst)
}

pub fn ansi<T: Display, U: Display>(x: T, y: U) -> String {
    format!("\x1b[{y}m{x}\x1b[0m")
}

pub fn report_pipeline_started(batch_size: usize, workers: usize) {
    if verbose() {
        println!(
            "loader pipeline started [batch {}, {} decode workers]",
            ansi(batch_size, 36),
            ansi(workers, 36),
        );
    }
}

pub fn report_pipeline_stopped(batches: u64, timer: &Instant) {
    if !verbose() {
        return;
    }

    let elapsed = timer.elapsed().as_secs_f32();
    let per_sec = if elapsed > 0.0 { batches as f32 / elapsed } else { 0.0 };

    println!(
        "loader pipeline stopped [{} batches in {}s, {} batches/sec]",
        ansi(batches, 36),
        ansi(format!("{elapsed:.1}"), 36),
        ansi(format!("{per_sec:.0}"), 36),
    );
}
