//! Telemetry initialization (tracing/tracing-subscriber).
//!
//! - LOG_LEVEL holds filter directives, e.g. "debug" or
//!   "info,sandbox=debug,tutor=debug,tower_http=info".
//! - LOG_FORMAT selects "pretty" (default) or "json" structured logs.
//!
//! Targets are per concern: `tasks`, `sandbox`, `tutor`, `variants` and
//! `aictutor_backend` for startup. The TraceLayer adds per-request spans on top.

use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str =
    "info,tasks=info,sandbox=info,tutor=debug,variants=debug,aictutor_backend=debug,tower_http=info,axum=info";

#[derive(Clone, Debug, PartialEq)]
pub struct LogSettings {
    pub filter: String,
    pub json: bool,
}

impl LogSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let filter = var("LOG_LEVEL")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_FILTER.to_string());
        let json = var("LOG_FORMAT").is_some_and(|f| f.trim().eq_ignore_ascii_case("json"));
        Self { filter, json }
    }
}

pub fn init_tracing() {
    init_with(&LogSettings::from_env());
}

pub fn init_with(settings: &LogSettings) {
    // A bad directive must not keep the server from starting.
    let filter = EnvFilter::try_new(&settings.filter).unwrap_or_else(|e| {
        eprintln!("invalid LOG_LEVEL {:?}: {e}; using defaults", settings.filter);
        EnvFilter::new(DEFAULT_FILTER)
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    // Json and pretty builders are different types, so init in each arm.
    if settings.json {
        builder.json().flatten_event(true).init();
    } else {
        builder.init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_pretty_with_default_filter() {
        let s = LogSettings::from_lookup(|_| None);
        assert_eq!(s.filter, DEFAULT_FILTER);
        assert!(!s.json);
    }

    #[test]
    fn reads_level_and_json_format() {
        let s = LogSettings::from_lookup(|k| match k {
            "LOG_LEVEL" => Some(" debug,sandbox=trace ".into()),
            "LOG_FORMAT" => Some("JSON".into()),
            _ => None,
        });
        assert_eq!(s.filter, "debug,sandbox=trace");
        assert!(s.json);
    }
}
