use pcode_esil::*;

use analysis::{OpType, Session};
use analysis_config::{AnalysisConfig, CommandLineAnalysisConfig};
use decoder::ArchInfo;
use listing::ListingDecoder;

use std::path::{Path, PathBuf};

use clap::Parser;
use itertools::Itertools;

/// Classify P-Code instructions and lower them to ESIL
#[derive(Parser, Debug)]
#[clap(about, version, author)]
enum Args {
    /// Analyze every instruction of an exported listing, printing one record per line
    Analyze {
        /// Path to an exported P-Code listing
        listing: PathBuf,
        /// Path to output file for analysis records (standard output if not given)
        #[clap(long)]
        output: Option<PathBuf>,
        /// Output the recovered control-flow graph as a GraphViz `.dot` file to the given path
        #[clap(long)]
        output_graphviz: Option<PathBuf>,
        #[clap(flatten)]
        logging: LoggingArgs,
        /// Advanced configuration options to tweak the analysis behavior
        #[clap(short = 'Z', long, arg_enum)]
        advanced_config: Vec<CommandLineAnalysisConfig>,
    },
    /// Evaluate the ESIL of a single instruction and show the registers it changed
    Emulate {
        /// Path to an exported P-Code listing
        listing: PathBuf,
        /// Address of the instruction, in hexadecimal
        #[clap(long, parse(try_from_str = parse_address))]
        address: u64,
        /// Initial register value, as `NAME=VALUE` (repeatable)
        #[clap(long = "reg")]
        registers: Vec<RegisterAssignment>,
        /// Give up after evaluating this many ESIL words
        #[clap(long, default_value_t = esil_machine::DEFAULT_STEP_LIMIT)]
        step_limit: usize,
        #[clap(flatten)]
        logging: LoggingArgs,
        /// Advanced configuration options to tweak the analysis behavior
        #[clap(short = 'Z', long, arg_enum)]
        advanced_config: Vec<CommandLineAnalysisConfig>,
    },
}

#[derive(clap::Args, Debug)]
struct LoggingArgs {
    /// Disable terminal logging, even for high severity alerts. Strongly discouraged for normal
    /// use.
    #[clap(long)]
    debug_disable_terminal_logging: bool,
    /// Force blocking for terminal logging. If too many messages are being spewed the logger,
    /// by default, does not block, but instead dumps a dropped-messages alert. This option
    /// forces it to block and dump even if too many are being sent.
    #[clap(long)]
    debug_forced_blocking_terminal_logging: bool,
    /// Path to send log (as JSON) to
    ///
    /// Error or higher severity alerts will still continue being shown at stderr (in addition
    /// to being added to the log)
    #[clap(long = "log")]
    log_file: Option<PathBuf>,
    /// Debug level (repeat for more: 0-warn, 1-info, 2-debug, 3-trace)
    #[clap(short, long, parse(from_occurrences))]
    debug: usize,
}

impl From<LoggingArgs> for log::LogOptions {
    fn from(a: LoggingArgs) -> Self {
        Self {
            debug_level: a.debug,
            disable_terminal_logging: a.debug_disable_terminal_logging,
            force_block: a.debug_forced_blocking_terminal_logging,
            path: a.log_file,
        }
    }
}

#[derive(Debug)]
struct RegisterAssignment {
    name: String,
    value: u64,
}

impl std::str::FromStr for RegisterAssignment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, value) = s
            .split_once('=')
            .ok_or_else(|| format!("expected NAME=VALUE, got `{}`", s))?;
        let value = esil_value::parse_int(value.trim())
            .ok_or_else(|| format!("`{}` is not a number", value))?;
        Ok(Self {
            name: name.trim().to_owned(),
            value,
        })
    }
}

fn parse_address(s: &str) -> Result<u64, String> {
    u64::from_str_radix(s.strip_prefix("0x").unwrap_or(s), 16)
        .map_err(|e| format!("`{}` is not a hexadecimal address: {}", s, e))
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error("could not access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Listing(#[from] listing::ListingError),
    #[error("could not set up logging: {0}")]
    Logging(#[from] sloggers::Error),
    #[error("instruction at {address:#x} was not analyzed: {reason}")]
    Unanalyzed {
        address: u64,
        reason: error::AnalysisError,
    },
    #[error("evaluation failed: {0}")]
    Evaluation(#[from] error::VmError),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CliError + '_ {
    move |source| CliError::Io {
        path: path.to_owned(),
        source,
    }
}

fn load(path: &Path) -> Result<ListingDecoder, CliError> {
    let text = std::fs::read_to_string(path).map_err(io_error(path))?;
    Ok(ListingDecoder::parse(&text)?)
}

fn run(args: Args) -> Result<(), CliError> {
    match args {
        Args::Analyze {
            listing,
            output,
            output_graphviz,
            logging,
            advanced_config,
        } => {
            let _log_guard =
                slog_scope::set_global_logger(log::FileAndTermDrain::new(&logging.into())?);
            AnalysisConfig::initialize(advanced_config);

            let session = Session::new(load(&listing)?);
            let records = session
                .decoder()
                .addresses()
                .into_iter()
                .map(|a| session.analyze(a))
                .collect_vec();

            let text: String = records.iter().map(|r| format!("{}\n", r)).collect();
            match output {
                Some(path) => std::fs::write(&path, text).map_err(io_error(&path))?,
                None => print!("{}", text),
            }

            if let Some(path) = output_graphviz {
                let dot = cfg::ControlFlowGraph::build(&records).generate_dot();
                std::fs::write(&path, dot).map_err(io_error(&path))?;
            }

            log::info!("Done";
                       "instructions" => records.len(),
                       log::OptionalKV("alignment", session.decoder().alignment()),
                       "unanalyzed" => records.iter().filter(|r| r.op_type == OpType::Unknown).count(),
            );
        }
        Args::Emulate {
            listing,
            address,
            registers,
            step_limit,
            logging,
            advanced_config,
        } => {
            let _log_guard =
                slog_scope::set_global_logger(log::FileAndTermDrain::new(&logging.into())?);
            AnalysisConfig::initialize(advanced_config);

            let session = Session::new(load(&listing)?);
            let record = session.analyze(address);
            println!("{}", record);
            if let Some(reason) = record.error {
                return Err(CliError::Unanalyzed { address, reason });
            }

            let mut machine =
                esil_machine::Machine::new(session.operators()).with_step_limit(step_limit);
            for (name, size) in session.decoder().registers() {
                machine.define_register(name, size);
            }
            let pc = session.decoder().program_counter();
            if machine.register_value(pc).is_none() {
                machine.define_register(pc, 8);
            }
            machine.set_register(pc, address)?;
            for RegisterAssignment { name, value } in registers {
                machine.set_register(&name, value)?;
            }

            let before = machine
                .registers()
                .map(|(n, v)| (n.to_owned(), v))
                .collect_vec();
            machine.run(&record.esil)?;
            for ((name, old), (_, new)) in before.iter().zip(machine.registers()) {
                if *old != new {
                    println!("{} = {:#x} (was {:#x})", name, new, old);
                }
            }
            log::trace!("Done"; "stack" => ?machine.stack());
        }
    }
    Ok(())
}

fn main() {
    if let Err(e) = run(Args::parse()) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
