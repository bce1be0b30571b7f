//! Tracing setup for processes embedding the admin layer.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn base_level(value: Option<&str>) -> &'static str {
    match value {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

fn filter_directives(level: &str) -> String {
    format!(
        "adminbus={level},adminbus_stat={level},adminbus::bridge::codec=off",
        level = level
    )
}

/// Initialize tracing with ADMINBUS_LOG and LOG_FORMAT support.
///
/// `RUST_LOG` takes precedence over `ADMINBUS_LOG` when set. Calling this
/// twice keeps the first subscriber.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = base_level(std::env::var("ADMINBUS_LOG").ok().as_deref());
        EnvFilter::new(filter_directives(level))
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_levels_fall_back_to_info() {
        assert_eq!(base_level(None), "info");
        assert_eq!(base_level(Some("loud")), "info");
        assert_eq!(base_level(Some("warning")), "warn");
    }

    #[test]
    fn codec_chatter_is_silenced() {
        let directives = filter_directives("debug");
        assert!(directives.starts_with("adminbus=debug"));
        assert!(directives.ends_with("adminbus::bridge::codec=off"));
    }
}
