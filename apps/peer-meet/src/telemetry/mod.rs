pub(crate) fn env_truthy(var: &str) -> Option<bool> {
    std::env::var(var)
        .ok()
        .map(|value| !value.is_empty() && value != "0" && !value.eq_ignore_ascii_case("false"))
}

pub mod logging {
    use clap::ValueEnum;
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    /// Overrides the computed filter with a full `EnvFilter` directive.
    pub const FILTER_ENV: &str = "PEER_MEET_LOG_FILTER";
    /// Lets dependency crates log at trace level too.
    pub const TRACE_DEPS_ENV: &str = "PEER_MEET_TRACE_DEPS";

    /// Targets used by this crate's own events.
    const OWN_TARGETS: &[&str] = &[
        "peer_meet",
        "relay",
        "signaling",
        "negotiation",
        "session",
        "room",
        "webrtc",
    ];

    const NOISY_DEPENDENCIES: &[&str] = &[
        "webrtc_ice",
        "webrtc_dtls",
        "webrtc_srtp",
        "webrtc_sctp",
        "webrtc_mdns",
        "tokio_tungstenite",
        "tungstenite",
        "reqwest",
        "hyper",
        "rustls",
        "mio",
    ];

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl LogLevel {
        pub fn to_filter(self) -> LevelFilter {
            match self {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
                LogLevel::Trace => LevelFilter::TRACE,
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to configure logger: {0}")]
        Configure(String),
    }

    static INIT: OnceLock<()> = OnceLock::new();
    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global subscriber. Later calls are no-ops.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if INIT.get().is_some() {
            return Ok(());
        }
        install(config)?;
        let _ = INIT.set(());
        Ok(())
    }

    fn install(config: &LogConfig) -> Result<(), InitError> {
        let (filter, throttled) = match std::env::var(FILTER_ENV) {
            Ok(directive) => (directive, false),
            Err(_) => default_directive(config.level.to_filter(), allow_dependency_traces()),
        };

        let (writer, guard) = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(filter))
            .with_target(config.level >= LogLevel::Info)
            .with_thread_names(config.level >= LogLevel::Trace)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| InitError::Configure(err.to_string()))?;

        let _ = GUARD.set(guard);
        if throttled {
            eprintln!(
                "[peer-meet] dependency traces capped at info; set {TRACE_DEPS_ENV}=1 or {FILTER_ENV} to override"
            );
        }
        Ok(())
    }

    fn allow_dependency_traces() -> bool {
        super::env_truthy(TRACE_DEPS_ENV).unwrap_or(false)
    }

    /// Builds the filter for `level`. Returns whether dependency traces were
    /// capped.
    fn default_directive(level: LevelFilter, dependency_traces: bool) -> (String, bool) {
        let verbose = match level {
            LevelFilter::TRACE => "trace",
            LevelFilter::DEBUG => "debug",
            _ => return (level.to_string().to_lowercase(), false),
        };
        let mut directive = String::from("info");
        for target in OWN_TARGETS {
            directive.push_str(&format!(",{target}={verbose}"));
        }
        let throttle = level == LevelFilter::TRACE && !dependency_traces;
        if throttle {
            for target in NOISY_DEPENDENCIES {
                directive.push_str(&format!(",{target}=info"));
            }
        }
        (directive, throttle)
    }

}
