//! `tracing` setup for applications embedding the user agent.
//!
//! Both crates log under their own module paths; SIP messages as they
//! cross the wire go to the [`WIRE_TARGET`] target at TRACE level and are
//! only shown when [`LoggingConfig::with_wire`] asks for them.

use std::str::FromStr;

use tracing::Level;
use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, fmt};

use crate::errors::{Error, Result};

/// Target of the per-message wire trace
pub const WIRE_TARGET: &str = "sipua::wire";

const OWN_CRATES: [&str; 2] = ["sipua_sip_core", "sipua_ua_core"];

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Level for the user agent crates
    pub level: Level,
    /// One JSON object per line instead of text
    pub json: bool,
    pub file_info: bool,
    /// Log span enter/exit
    pub log_spans: bool,
    /// Log every SIP message sent or received
    pub wire: bool,
    /// Level for everything else (tokio, the application)
    pub other: Level,
    pub app_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: Level::INFO,
            json: false,
            file_info: false,
            log_spans: false,
            wire: false,
            other: Level::WARN,
            app_name: "sipua".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn new(level: Level, app_name: impl Into<String>) -> Self {
        LoggingConfig {
            level,
            app_name: app_name.into(),
            ..Default::default()
        }
    }

    pub fn with_json(mut self) -> Self {
        self.json = true;
        self
    }

    pub fn with_file_info(mut self) -> Self {
        self.file_info = true;
        self
    }

    pub fn with_spans(mut self) -> Self {
        self.log_spans = true;
        self
    }

    pub fn with_wire(mut self) -> Self {
        self.wire = true;
        self
    }

    /// Filter directives, lowest priority first: everything at `other`,
    /// the user agent crates at `level`, the wire trace on or off.
    pub fn directives(&self) -> Vec<String> {
        let mut directives = vec![self.other.to_string().to_lowercase()];
        for krate in OWN_CRATES {
            directives.push(format!("{}={}", krate, self.level.to_string().to_lowercase()));
        }
        let wire = if self.wire { "trace" } else { "off" };
        directives.push(format!("{}={}", WIRE_TARGET, wire));
        directives
    }

    /// `RUST_LOG` directives come on top of [`LoggingConfig::directives`].
    fn filter(&self) -> Result<EnvFilter> {
        let mut filter = EnvFilter::new(self.directives().join(","));
        if let Ok(env) = std::env::var(EnvFilter::DEFAULT_ENV) {
            for directive in env.split(',').filter(|d| !d.trim().is_empty()) {
                let directive = directive
                    .parse()
                    .map_err(|e| Error::Config(format!("bad RUST_LOG directive {}: {}", directive, e)))?;
                filter = filter.add_directive(directive);
            }
        }
        Ok(filter)
    }
}

/// Build a subscriber for `config` writing to `writer`, without installing
/// it.
pub fn build_subscriber<W>(config: &LoggingConfig, writer: W) -> Result<Box<dyn Subscriber + Send + Sync>>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let span_events = if config.log_spans {
        FmtSpan::ACTIVE
    } else {
        FmtSpan::NONE
    };
    let builder = fmt::Subscriber::builder()
        .with_env_filter(config.filter()?)
        .with_span_events(span_events)
        .with_file(config.file_info)
        .with_line_number(config.file_info)
        .with_writer(writer);

    Ok(if config.json {
        Box::new(builder.json().finish())
    } else {
        Box::new(builder.finish())
    })
}

/// Install the global subscriber, logging to stdout.
///
/// Fails if one is already installed.
pub fn setup_logging(config: LoggingConfig) -> Result<()> {
    let subscriber = build_subscriber(&config, std::io::stdout)?;
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Config(format!("Cannot install logger: {}", e)))
}

pub fn parse_log_level(level: &str) -> Result<Level> {
    Level::from_str(level).map_err(|_| Error::Config(format!("Invalid log level: {}", level)))
}

pub fn log_welcome(app_name: &str, version: &str) {
    tracing::info!("Starting {} v{} (user agent core {})", app_name, version, crate::VERSION);
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    /// Collects everything written by a subscriber
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'w> MakeWriter<'w> for Captured {
        type Writer = Captured;

        fn make_writer(&'w self) -> Self::Writer {
            self.clone()
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).to_string()
        }
    }

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("WARN").unwrap(), Level::WARN);
        assert!(parse_log_level("loud").is_err());
    }

    #[test]
    fn test_directives() {
        let c = LoggingConfig::new(Level::DEBUG, "phone");
        assert_eq!(
            c.directives(),
            vec!["warn", "sipua_sip_core=debug", "sipua_ua_core=debug", "sipua::wire=off"]
        );
        assert_eq!(c.with_wire().directives().last().unwrap(), "sipua::wire=trace");
    }

    #[test]
    #[serial_test::serial]
    fn test_wire_trace_only_when_asked() {
        let out = Captured::default();
        let quiet = build_subscriber(&LoggingConfig::new(Level::TRACE, "t"), out.clone()).unwrap();
        tracing::subscriber::with_default(quiet, || {
            tracing::trace!(target: "sipua::wire", "INVITE sip:bob@10.0.0.2 SIP/2.0");
        });
        assert!(out.text().is_empty());

        let loud = build_subscriber(&LoggingConfig::new(Level::INFO, "t").with_wire(), out.clone()).unwrap();
        tracing::subscriber::with_default(loud, || {
            tracing::trace!(target: "sipua::wire", "INVITE sip:bob@10.0.0.2 SIP/2.0");
        });
        assert!(out.text().contains("INVITE sip:bob@10.0.0.2"));
    }

    #[test]
    #[serial_test::serial]
    fn test_json_lines() {
        let out = Captured::default();
        let config = LoggingConfig::new(Level::INFO, "t").with_json();
        let subscriber = build_subscriber(&config, out.clone()).unwrap();
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(target: "sipua_ua_core::transport", peer = "10.0.0.2:5060", "connection refused");
        });
        let text = out.text();
        let line: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(line["level"], "WARN");
        assert_eq!(line["fields"]["message"], "connection refused");
        assert_eq!(line["fields"]["peer"], "10.0.0.2:5060");
    }

    #[test]
    #[serial_test::serial]
    fn test_second_install_fails() {
        let _ = setup_logging(LoggingConfig::default());
        assert!(setup_logging(LoggingConfig::default()).is_err());
    }
}
