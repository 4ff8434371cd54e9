pub mod analysis;
pub mod analysis_config;
pub mod cfg;
pub mod containers;
pub mod decoder;
pub mod error;
pub mod esil_lowering;
pub mod esil_machine;
pub mod esil_operators;
pub mod esil_value;
pub mod flow;
pub mod listing;
pub mod pcode;
pub mod tagger;
pub mod tests;

pub mod log {
    pub use slog_scope::{crit, debug, error, info, trace, warn};

    /// A key-value pair that is only logged when the value is present
    pub struct OptionalKV<V: slog::Value>(pub &'static str, pub Option<V>);
    impl<V: slog::Value> slog::KV for OptionalKV<V> {
        fn serialize(
            &self,
            record: &slog::Record,
            serializer: &mut dyn slog::Serializer,
        ) -> slog::Result {
            match &self.1 {
                Some(v) => v.serialize(record, self.0, serializer),
                None => Ok(()),
            }
        }
    }

    /// Where, and how loudly, to log.
    #[derive(Clone, Debug, Default)]
    pub struct LogOptions {
        /// 0-warn, 1-info, 2-debug, 3 and up-trace
        pub debug_level: usize,
        pub disable_terminal_logging: bool,
        /// Block on a full terminal channel rather than dropping messages
        pub force_block: bool,
        /// JSON log file. When set, the terminal only shows errors.
        pub path: Option<std::path::PathBuf>,
    }

    impl LogOptions {
        fn severity(&self) -> sloggers::types::Severity {
            use sloggers::types::Severity;
            match self.debug_level {
                0 => Severity::Warning,
                1 => Severity::Info,
                2 => Severity::Debug,
                _ => Severity::Trace,
            }
        }
    }

    /// Fans records out to an optional file and the terminal.
    pub struct FileAndTermDrain {
        file_drain: Option<slog::Logger>,
        term_drain: slog::Logger,
    }
    impl FileAndTermDrain {
        pub fn new(options: &LogOptions) -> Result<slog::Logger, sloggers::Error> {
            use sloggers::types::{Format, OverflowStrategy, Severity};
            use sloggers::Build;

            let term_drain = if options.disable_terminal_logging {
                sloggers::null::NullLoggerBuilder.build()?
            } else {
                sloggers::terminal::TerminalLoggerBuilder::new()
                    .destination(sloggers::terminal::Destination::Stderr)
                    .level(match options.path {
                        None => options.severity(),
                        Some(_) => Severity::Error,
                    })
                    .overflow_strategy(if options.force_block || options.path.is_none() {
                        OverflowStrategy::Block
                    } else {
                        OverflowStrategy::DropAndReport
                    })
                    .format(Format::Compact)
                    .build()?
            };

            let file_drain = match &options.path {
                Some(path) => Some(
                    sloggers::file::FileLoggerBuilder::new(path)
                        .truncate()
                        .level(options.severity())
                        .overflow_strategy(OverflowStrategy::Block)
                        .format(Format::Json)
                        .build()?,
                ),
                None => None,
            };

            Ok(slog::Logger::root(
                Self {
                    file_drain,
                    term_drain,
                },
                slog::o!(),
            ))
        }
    }
    impl slog::Drain for FileAndTermDrain {
        type Ok = ();
        type Err = slog::Never;
        fn log(
            &self,
            r: &slog::Record<'_>,
            kv: &slog::OwnedKVList,
        ) -> Result<<Self as slog::Drain>::Ok, <Self as slog::Drain>::Err> {
            if let Some(f) = &self.file_drain {
                <slog::Logger as slog::Drain>::log(f, r, kv)?;
            }
            <slog::Logger as slog::Drain>::log(&self.term_drain, r, kv)?;
            Ok(())
        }
    }
}
