use std::{
    env,
    io::{stderr, IsTerminal, Write},
    sync::{Arc, Mutex},
};

use anyhow::Result;
use log::{LevelFilter, Metadata, Record};
use termcolor::{BufferedStandardStream, Color, ColorChoice, ColorSpec, WriteColor};
use time::{macros::format_description, OffsetDateTime};

/// Logger for log:: messages, writing to stderr. Summaries and listings are
/// printed on stdout so they can be piped without the logs.
pub(crate) struct Logger {
    max_level: LevelFilter,
    inner: Mutex<LoggerWriter>,
}

struct LoggerWriter {
    stderr: BufferedStandardStream,
    use_colors: bool,
}

impl Logger {
    fn new(max_level: LevelFilter) -> Self {
        Logger {
            max_level,
            inner: Mutex::new(LoggerWriter {
                stderr: BufferedStandardStream::stderr(ColorChoice::Auto),
                use_colors: Self::use_colors(),
            }),
        }
    }

    /// Install the logger as the global one.
    pub(crate) fn init(max_level: LevelFilter) -> Result<Arc<Self>> {
        let logger = Arc::new(Logger::new(max_level));

        log::set_max_level(max_level);
        log::set_boxed_logger(Box::new(Arc::clone(&logger)))?;

        Ok(logger)
    }

    /// Format a record. Timestamps and module paths are only shown when
    /// debug messages are enabled; the level is shown for warnings, errors
    /// and in debug mode.
    fn write_record<W>(&self, out: &mut W, use_colors: bool, record: &Record) -> Result<()>
    where
        W: WriteColor,
    {
        static LEVEL_COLORS: &[Option<Color>] = &[
            None,                // Default.
            Some(Color::Red),    // Error.
            Some(Color::Yellow), // Warn.
            Some(Color::Green),  // Info.
            Some(Color::Cyan),   // Debug.
            Some(Color::White),  // Trace.
        ];
        let debug = self.max_level >= LevelFilter::Debug;

        if debug {
            OffsetDateTime::now_utc().format_into(
                out,
                format_description!("[hour]:[minute]:[second].[subsecond digits:6] "),
            )?;
        }

        if record.level() <= LevelFilter::Warn || debug {
            if use_colors {
                out.set_color(ColorSpec::new().set_fg(LEVEL_COLORS[record.level() as usize]))?;
            }
            write!(out, "{:5} ", record.level())?;
            if use_colors {
                out.reset()?;
            }
        }

        if debug {
            if let Some(path) = record.module_path() {
                write!(out, "[{path}] ")?;
            }
        }

        writeln!(out, "{}", record.args())?;
        Ok(())
    }

    fn try_log(&self, record: &Record) -> Result<()> {
        let inner: &mut LoggerWriter = &mut self.inner.lock().unwrap();
        let use_colors = inner.use_colors;

        self.write_record(&mut inner.stderr, use_colors, record)?;
        inner.stderr.flush()?;
        Ok(())
    }

    fn use_colors() -> bool {
        stderr().is_terminal() && matches!(env::var("TERM"), Ok(x) if x != "dumb")
    }
}

impl log::Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // Nowhere to report a logging error.
        let _ = self.try_log(record);
    }

    fn flush(&self) {
        let _ = self.inner.lock().unwrap().stderr.flush();
    }
}

#[cfg(test)]
mod tests {
    use log::{Level, Log};
    use termcolor::Buffer;
    use test_case::test_case;

    use super::*;

    fn format(max_level: LevelFilter, level: Level) -> String {
        let logger = Logger::new(max_level);
        let mut buf = Buffer::no_color();
        logger
            .write_record(
                &mut buf,
                false,
                &Record::builder()
                    .args(format_args!("client attached"))
                    .level(level)
                    .module_path(Some("hook::provider"))
                    .build(),
            )
            .unwrap();
        String::from_utf8(buf.into_inner()).unwrap()
    }

    #[test_case(Level::Info => "client attached\n" ; "info")]
    #[test_case(Level::Warn => "WARN  client attached\n" ; "warn")]
    #[test_case(Level::Error => "ERROR client attached\n" ; "error")]
    fn format_info(level: Level) -> String {
        format(LevelFilter::Info, level)
    }

    #[test]
    fn format_debug() {
        let line = format(LevelFilter::Debug, Level::Debug);
        // Timestamp first, e.g. "12:34:56.123456 ".
        assert_eq!(line.find(' '), Some(15));
        assert!(line.ends_with("DEBUG [hook::provider] client attached\n"));
    }

    #[test]
    fn enabled() {
        let logger = Logger::new(LevelFilter::Warn);
        assert!(logger.enabled(&Metadata::builder().level(Level::Error).build()));
        assert!(!logger.enabled(&Metadata::builder().level(Level::Info).build()));
    }
}
