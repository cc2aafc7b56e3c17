use pmoconfig::Config;
use tracing_subscriber::EnvFilter;

/// Installe le subscriber global.
///
/// Le niveau par défaut vient de `host.logger.min_level`; `RUST_LOG` le
/// remplace quand il est défini.
pub fn init(config: &Config) {
    let level = config
        .get_log_min_level()
        .unwrap_or_else(|_| "info".to_string())
        .to_lowercase();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

    let enable_console = config.get_log_enable_console().unwrap_or(true);

    if enable_console {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_level(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::sink)
            .init();
    }
}
