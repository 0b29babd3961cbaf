use std::fs;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initializes logging: human-readable console output plus a daily-rotated
/// JSON log file under `logs/`.
pub fn init_logging() {
    let _ = fs::create_dir_all("logs");

    let file_appender = tracing_appender::rolling::daily("logs", "serving.log");
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer().json().with_writer(non_blocking_writer);
    let console_layer = fmt::layer().compact().with_writer(std::io::stdout);

    let filter = EnvFilter::from_default_env()
        .add_directive("inference_serving=info".parse().unwrap());

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .init();

    // Keep the appender guard alive for the process lifetime so buffered
    // log lines are flushed on exit.
    std::mem::forget(guard);
}
