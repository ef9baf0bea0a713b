use std::io::Write;
use log::LevelFilter;

/// Install the process-wide logger.
///
/// Defaults to `info`; `RUST_LOG` overrides it per module as usual.
/// Safe to call more than once, later calls are no-ops.
pub fn setup_logging() {
    let _ = env_logger::Builder::new()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}: {}",
                buf.timestamp_millis(),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_twice_does_not_panic() {
        setup_logging();
        setup_logging();
        log::info!("logger ready");
    }
}
