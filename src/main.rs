use ipfact::*;

use std::path::PathBuf;

use clap::Parser;

/// Deduce and manifest interprocedural facts over a textual IR module
#[derive(Parser, Debug)]
#[clap(about, version, author)]
enum Args {
    /// Run the fixpoint engine over a textual IR module and print the rewritten module
    Run {
        /// Path to a textual IR file
        input: PathBuf,
        /// Path to write the rewritten module to; stdout if omitted
        #[clap(long)]
        output: Option<PathBuf>,
        /// Disable terminal logging, even for high severity alerts. Strongly discouraged for
        /// normal use.
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
        #[clap(long = "--log")]
        log_file: Option<PathBuf>,
        /// Debug level (repeat for more: 0-warn, 1-info, 2-debug, 3-trace)
        #[clap(short, long, parse(from_occurrences))]
        debug: usize,
        /// Advanced configuration options to tweak the engine behavior
        #[clap(short = 'Z', long, arg_enum)]
        advanced_config: Vec<config::CommandLineEngineConfig>,
    },
}

fn main() {
    let args = Args::parse();

    match args {
        Args::Run {
            input,
            output,
            debug_disable_terminal_logging,
            debug_forced_blocking_terminal_logging,
            log_file,
            debug,
            advanced_config,
        } => {
            let _log_guard = slog_scope::set_global_logger(crate::log::FileAndTermDrain::new(
                debug,
                debug_disable_terminal_logging,
                debug_forced_blocking_terminal_logging,
                log_file,
            ));

            config::EngineConfig::initialize(advanced_config);

            let text = std::fs::read_to_string(input).expect("IR file could not be read");
            let mut module = reader::parse_module(&text);

            let changed = callgraph::run_on_module(&mut module);
            log::info!("run complete"; "changed" => changed);

            if let Some(path) = output {
                use std::io::Write;
                write!(std::fs::File::create(path).unwrap(), "{}", module).unwrap();
            } else {
                println!("{}", module);
            }
        }
    }
}
