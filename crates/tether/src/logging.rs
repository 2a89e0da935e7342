//! Tracing initialization for binaries and tests embedding the engine.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Install a global subscriber writing to stderr.
///
/// `RUST_LOG` wins when set. Otherwise `TETHER_LOG` picks the level for this
/// crate (`debug`, `warn`, `error`, default `info`). `LOG_FORMAT=json` switches
/// to JSON lines. Calling this more than once is harmless.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(format!(
            "tether={}",
            level_from(std::env::var("TETHER_LOG").ok().as_deref())
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn level_from(value: Option<&str>) -> &'static str {
    match value {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_mapping() {
        assert_eq!(level_from(Some("debug")), "debug");
        assert_eq!(level_from(Some("warning")), "warn");
        assert_eq!(level_from(Some("nonsense")), "info");
        assert_eq!(level_from(None), "info");
    }

    #[test]
    fn init_is_idempotent() {
        init_tracing();
        init_tracing();
    }
}
