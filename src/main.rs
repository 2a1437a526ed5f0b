use std::path::PathBuf;
use std::process;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use ristretto::profiler::Profiler;
use ristretto::runtime::Config;
use ristretto::trace::{LogTrace, NoTrace, TraceSink};
use ristretto::{Error, Outcome, Session};

/// Run a method of a compiled C# program through the CIL interpreter.
#[derive(Parser, Debug)]
#[command(name = "ristretto", version, about)]
struct Args {
    /// Assembly (.dll, .exe), C# source (.cs) or project (.csproj)
    input: PathBuf,

    /// Namespace of the entry type, empty for the global namespace
    namespace: String,

    /// Name of the entry type
    class: String,

    /// Method to run
    #[arg(long, default_value = "Main")]
    method: String,

    /// Fail on opcodes the interpreter does not know instead of halting
    #[arg(long)]
    strict: bool,

    /// Maximum number of instructions to execute
    #[arg(long, value_name = "N")]
    fuel: Option<u64>,

    /// Log every executed instruction
    #[arg(long)]
    trace: bool,

    /// Print the executed instruction count and how often each loop
    /// header was re-entered; loops re-entered more than twice are hot
    #[arg(long)]
    stats: bool,
}

fn init_logging(trace: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if trace {
            EnvFilter::new("info,ristretto=debug")
        } else {
            EnvFilter::new("info")
        }
    });

    fmt().with_env_filter(filter).with_target(false).init();
}

fn main() {
    let args = Args::parse();
    init_logging(args.trace);

    let session = match Session::open(&args.input) {
        Ok(session) => session,
        Err(e) => {
            report(&e);
            process::exit(1);
        }
    };

    let config = Config {
        strict_opcodes: args.strict,
        max_instructions: args.fuel,
    };
    let mut profiler = Profiler::new();
    let result = if args.trace {
        run(&session, &args, config, (LogTrace, &mut profiler))
    } else {
        run(&session, &args, config, (NoTrace, &mut profiler))
    };

    match result {
        Ok(outcome) => {
            print_outcome(&outcome);
            if args.stats {
                print_stats(&profiler);
            }
        }
        Err(e) => {
            report(&e);
            process::exit(1);
        }
    }
}

fn report(e: &Error) {
    error!("{e}");
    if let Error::Compile(err) = e {
        for line in err.details() {
            error!("{line}");
        }
    }
}

fn run(
    session: &Session,
    args: &Args,
    config: Config,
    mut sink: impl TraceSink,
) -> ristretto::Result<Outcome> {
    session.run(&args.namespace, &args.class, &args.method, config, &mut sink)
}

fn print_outcome(outcome: &Outcome) {
    println!("{}", outcome.termination);
    println!("stack ({}):", outcome.stack.len());
    for (depth, value) in outcome.stack.iter().rev().enumerate() {
        println!("  [{depth}] {value}");
    }
    println!("locals ({}):", outcome.locals.len());
    for (index, value) in outcome.locals.iter().enumerate() {
        println!("  V_{index} = {value}");
    }
}

fn print_stats(profiler: &Profiler) {
    info!(executed = profiler.executed(), "profile");
    println!("executed {} instructions", profiler.executed());
    for (pc, entries) in profiler.loops() {
        let hot = if profiler.is_hot(pc) { " (hot)" } else { "" };
        println!("  loop at IL_{pc:04x}: {entries} entries{hot}");
    }
}
