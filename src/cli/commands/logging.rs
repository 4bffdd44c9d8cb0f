use clap::{builder::ValueParser, Arg, Command};
use tracing::{level_filters::LevelFilter, Level};
use tracing_subscriber::EnvFilter;

pub const ARG_VERBOSITY: &str = "verbosity";
pub const ENV_LOG_LEVEL: &str = "MILLEGRILLES_AUTH_LOG_LEVEL";

/// Log target of this crate.
const CRATE_TARGET: &str = env!("CARGO_CRATE_NAME");

#[must_use]
pub fn level(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        3 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// `RUST_LOG` when set. Otherwise this crate logs at the verbosity level and
/// dependencies at `warn` at most.
#[must_use]
pub fn env_filter(verbosity: u8) -> EnvFilter {
    let level = level(verbosity);
    let others = LevelFilter::from_level(level).min(LevelFilter::WARN);
    let directives = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.trim().is_empty() => directives,
        _ => format!("{others},{CRATE_TARGET}={level}"),
    };
    EnvFilter::builder()
        .with_default_directive(others.into())
        .parse_lossy(directives)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter_text(verbosity: u8) -> String {
        env_filter(verbosity).to_string().to_lowercase()
    }

    #[test]
    fn named_levels_map_to_counts() {
        let levels = ["error", "warn", "info", "debug", "trace"];
        for (index, &name) in levels.iter().enumerate() {
            temp_env::with_vars([(ENV_LOG_LEVEL, Some(name))], || {
                let matches = with_args(Command::new("test")).get_matches_from(vec!["test"]);
                let verbosity = matches.get_one::<u8>(ARG_VERBOSITY).copied();
                assert_eq!(verbosity, u8::try_from(index).ok());
                assert_eq!(level(verbosity.unwrap()).as_str().to_lowercase(), name);
            });
        }
    }

    #[test]
    fn unknown_level_is_refused() {
        temp_env::with_vars([(ENV_LOG_LEVEL, Some("loud"))], || {
            assert!(with_args(Command::new("test"))
                .try_get_matches_from(vec!["test"])
                .is_err());
        });
    }

    #[test]
    fn verbosity_applies_to_this_crate_only() {
        temp_env::with_var_unset(EnvFilter::DEFAULT_ENV, || {
            let debug = filter_text(3);
            assert!(debug.contains("millegrilles_auth=debug"), "{debug}");
            assert!(debug.contains("warn"), "{debug}");

            let quiet = filter_text(0);
            assert!(quiet.contains("millegrilles_auth=error"), "{quiet}");
            assert!(!quiet.contains("warn"), "{quiet}");
        });
    }

    #[test]
    fn rust_log_replaces_crate_directive() {
        temp_env::with_var(EnvFilter::DEFAULT_ENV, Some("x509_parser=trace"), || {
            let text = filter_text(3);
            assert!(text.contains("x509_parser=trace"), "{text}");
            assert!(!text.contains("millegrilles_auth"), "{text}");
        });
    }
}
