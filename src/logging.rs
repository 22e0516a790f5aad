use std::path::Path;

use tracing::level_filters::LevelFilter;

/// Initialize structured JSON logging.
///
/// Defaults to `info` level unless overridden by `MIRAGE_LOG`. May be called
/// more than once; later calls are no-ops.
pub fn init() {
    init_with_log_dir(None, LevelFilter::INFO);
}

/// Initialize logging with an additional plain-text layer appended to
/// `<log_dir>/server.log`. `MIRAGE_LOG` still overrides `default_level`.
///
/// The file layer is best-effort: if the log file cannot be opened the JSON
/// stdout layer still comes up (startup validation reports the real
/// permission problem separately).
pub fn init_with_log_dir(log_dir: Option<&Path>, default_level: LevelFilter) {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::builder()
        .with_env_var("MIRAGE_LOG")
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let file_layer = log_dir.and_then(|dir| {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("server.log"))
            .ok()?;
        Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file),
        )
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true),
        )
        .with(file_layer)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init();
        init();
    }
}
