use std::path::Path;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

struct LocalTimer;

impl tracing_subscriber::fmt::time::FormatTime for LocalTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Local::now();
        write!(w, "{}", now.to_rfc3339())
    }
}

// Console logging, plus daily-rolling file persistence when a log directory
// is provided. Safe to call more than once; later calls are no-ops.
pub fn init_logger(log_dir: Option<&Path>) {
    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console_layer = fmt::Layer::new()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .with_timer(LocalTimer);

    let registry = tracing_subscriber::registry()
        .with(filter_layer)
        .with(console_layer);

    match log_dir {
        Some(dir) => {
            if let Err(e) = std::fs::create_dir_all(dir) {
                eprintln!("Failed to create log directory {:?}: {}", dir, e);
                let _ = registry.try_init();
                return;
            }
            let file_appender = tracing_appender::rolling::daily(dir, "gantry.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = fmt::Layer::new()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .with_level(true)
                .with_timer(LocalTimer);
            let _ = registry.with(file_layer).try_init();
            // The writer guard must outlive the process for buffered lines to flush.
            std::mem::forget(guard);
            info!("Log system initialized (console + file persistence)");
        }
        None => {
            let _ = registry.try_init();
            info!("Log system initialized (console only)");
        }
    }
}
