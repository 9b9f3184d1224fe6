use clap::ValueEnum;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::error::{Error, ErrorDetails};

#[derive(Clone, Debug, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

const DEFAULT_GATEWAY_NON_DEBUG_DIRECTIVES: &str = "warn,gateway=info,tiergate_internal=info";
const DEFAULT_GATEWAY_DEBUG_DIRECTIVES: &str = "warn,gateway=debug,tiergate_internal=debug";

/// A handle produced by `setup_observability` that switches the log filter to
/// `DEFAULT_GATEWAY_DEBUG_DIRECTIVES` once `gateway.debug` has been read from the config file.
pub struct DelayedDebugLogs {
    enable_cb: Box<dyn FnOnce() -> Result<(), Error> + Send + Sync>,
}

impl DelayedDebugLogs {
    pub fn enable_debug(self) -> Result<(), Error> {
        (self.enable_cb)()
    }
}

pub struct ObservabilityHandle {
    pub delayed_debug_logs: DelayedDebugLogs,
}

/// Installs the global `tracing` subscriber.
///
/// If `RUST_LOG` is set it is used verbatim, and `gateway.debug` has no effect.
/// Otherwise we start with `DEFAULT_GATEWAY_NON_DEBUG_DIRECTIVES`, so that warnings emitted
/// while the config file is being parsed are still visible.
pub fn setup_observability(log_format: LogFormat) -> Result<ObservabilityHandle, Error> {
    let env_var_name = "RUST_LOG";
    let has_env_var = std::env::var(env_var_name).is_ok();

    let base_filter = if has_env_var {
        EnvFilter::builder()
            .with_env_var(env_var_name)
            .from_env()
            .map_err(|e| {
                Error::new(ErrorDetails::Observability {
                    message: format!("Invalid `{env_var_name}` environment variable: {e}"),
                })
            })?
    } else {
        parse_directives(DEFAULT_GATEWAY_NON_DEBUG_DIRECTIVES)?
    };

    let (log_level, update_log_level) = tracing_subscriber::reload::Layer::new(base_filter);

    let log_layer = match log_format {
        LogFormat::Pretty => {
            Box::new(tracing_subscriber::fmt::layer()) as Box<dyn Layer<_> + Send + Sync>
        }
        LogFormat::Json => Box::new(tracing_subscriber::fmt::layer().json()),
    };

    tracing_subscriber::registry()
        .with(log_layer.with_filter(log_level))
        .try_init()
        .map_err(|e| {
            Error::new(ErrorDetails::Observability {
                message: format!("Failed to install tracing subscriber: {e}"),
            })
        })?;

    let delayed_debug_logs = if has_env_var {
        DelayedDebugLogs {
            enable_cb: Box::new(|| Ok(())),
        }
    } else {
        DelayedDebugLogs {
            enable_cb: Box::new(move || {
                let debug_filter = parse_directives(DEFAULT_GATEWAY_DEBUG_DIRECTIVES)?;
                update_log_level
                    .modify(move |l| {
                        *l = debug_filter;
                    })
                    .map_err(|e| {
                        Error::new(ErrorDetails::Observability {
                            message: format!("Failed to enable debug logs: {e}"),
                        })
                    })
            }),
        }
    };

    Ok(ObservabilityHandle { delayed_debug_logs })
}

fn parse_directives(directives: &str) -> Result<EnvFilter, Error> {
    EnvFilter::builder().parse(directives).map_err(|e| {
        Error::new(ErrorDetails::InternalError {
            message: format!("Failed to parse log directives `{directives}`: {e}"),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_parse() {
        assert!(parse_directives(DEFAULT_GATEWAY_NON_DEBUG_DIRECTIVES).is_ok());
        assert!(parse_directives(DEFAULT_GATEWAY_DEBUG_DIRECTIVES).is_ok());
    }

    #[test]
    fn test_log_format_from_cli_value() {
        assert!(matches!(
            LogFormat::from_str("json", true),
            Ok(LogFormat::Json)
        ));
        assert!(matches!(
            LogFormat::from_str("pretty", true),
            Ok(LogFormat::Pretty)
        ));
        assert!(LogFormat::from_str("xml", true).is_err());
    }
}
