//! Typeflow CLI

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use typeflow::interp::{Interpreter, Outcome, Reference, Value};
use typeflow::{CompilationUnit, PassConfig, PassError, TypeIndex};

#[derive(Parser)]
#[command(name = "typeflow", version, about = "Type-flow analysis and reduction for GC graphs")]
struct Cli {
    /// Pass configuration (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log analysis and rewrite decisions
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the input type recorded for each type-dependent operation
    Analyze {
        /// Compilation unit (JSON)
        file: PathBuf,
    },
    /// Print the reduced graph
    Reduce {
        /// Compilation unit (JSON)
        file: PathBuf,
        /// Emit the reduced unit as JSON
        #[arg(long)]
        json: bool,
    },
    /// Interpret the unit's graph
    Run {
        /// Compilation unit (JSON)
        file: PathBuf,
        /// Arguments: integers, `null`, `host:N`, `func:N` or `new:T`
        #[arg(long, num_args = 0.., allow_hyphen_values = true)]
        args: Vec<String>,
        /// Initial global values, same syntax as arguments
        #[arg(long = "global", value_name = "INDEX=VALUE")]
        globals: Vec<String>,
        /// Interpret the reduced graph instead of the original
        #[arg(long)]
        reduced: bool,
        /// Maximum number of blocks to enter
        #[arg(long, default_value_t = Interpreter::DEFAULT_FUEL)]
        fuel: usize,
    },
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose { "typeflow=debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let result = load_config(cli.config.as_deref()).and_then(|config| match cli.command {
        Command::Analyze { file } => analyze_file(&file, &config),
        Command::Reduce { file, json } => reduce_file(&file, config, json),
        Command::Run {
            file,
            args,
            globals,
            reduced,
            fuel,
        } => run_file(&file, config, &args, &globals, reduced, fuel),
    });

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> Result<PassConfig, PassError> {
    match path {
        Some(path) => PassConfig::load(path),
        None => Ok(PassConfig::default()),
    }
}

fn analyze_file(path: &Path, config: &PassConfig) -> Result<(), PassError> {
    let unit = CompilationUnit::load(path)?;
    let analysis = unit.analyze(config)?;

    for (op, ty) in analysis.input_types.iter() {
        println!("{op} {}: {ty}", unit.graph.op(op).opcode.name());
    }
    if !analysis.loop_headers.is_empty() {
        let headers: Vec<String> = analysis.loop_headers.iter().map(|b| b.to_string()).collect();
        println!("loop headers: {}", headers.join(", "));
    }
    if !analysis.unreachable_blocks.is_empty() {
        let dead: Vec<String> = analysis.unreachable_blocks.iter().map(|b| b.to_string()).collect();
        println!("unreachable: {}", dead.join(", "));
    }
    Ok(())
}

fn reduce_file(path: &Path, config: PassConfig, json: bool) -> Result<(), PassError> {
    let unit = CompilationUnit::load(path)?;
    let optimized = unit.optimize(config)?;

    if json {
        let reduced = CompilationUnit {
            graph: optimized.graph,
            ..unit
        };
        println!("{}", reduced.to_json()?);
    } else {
        print!("{}", optimized.graph);
        eprintln!("{}", optimized.stats.reductions);
    }
    Ok(())
}

fn run_file(
    path: &Path,
    config: PassConfig,
    args: &[String],
    globals: &[String],
    reduced: bool,
    fuel: usize,
) -> Result<(), PassError> {
    let unit = CompilationUnit::load(path)?;
    let graph = if reduced {
        unit.optimize(config)?.graph
    } else {
        unit.validate()?;
        unit.graph.clone()
    };

    let mut interpreter = Interpreter::new(&unit.module).with_fuel(fuel);
    for global in globals {
        let Some((index, value)) = global.split_once('=') else {
            return Err(PassError::parse_error(format!("invalid global `{global}`")));
        };
        let index: u32 = index
            .parse()
            .map_err(|_| PassError::parse_error(format!("invalid global index `{index}`")))?;
        let value = parse_argument(&mut interpreter, value)?;
        interpreter.set_global(index, value)?;
    }
    let mut values = Vec::with_capacity(args.len());
    for arg in args {
        values.push(parse_argument(&mut interpreter, arg)?);
    }
    if values.len() != unit.signature.params.len() {
        return Err(PassError::parse_error(format!(
            "expected {} argument(s), got {}",
            unit.signature.params.len(),
            values.len()
        )));
    }

    let outcome = interpreter.run(&graph, &values)?;
    match outcome {
        Outcome::Returned(Some(value)) => println!("returned {value}"),
        Outcome::Returned(None) => println!("returned"),
        Outcome::Trapped(trap) => println!("trapped: {trap}"),
    }
    Ok(())
}

fn parse_argument(interpreter: &mut Interpreter<'_>, arg: &str) -> Result<Value, PassError> {
    let invalid = || PassError::parse_error(format!("invalid argument `{arg}`"));
    if arg == "null" {
        return Ok(Value::NULL);
    }
    if let Some((kind, n)) = arg.split_once(':') {
        let n: u32 = n.parse().map_err(|_| invalid())?;
        return match kind {
            "host" => Ok(Value::Ref(Reference::Host(n))),
            "func" => Ok(Value::Ref(Reference::Func(n))),
            "new" => interpreter
                .allocate_default(TypeIndex(n))
                .map_err(PassError::from),
            _ => Err(invalid()),
        };
    }
    arg.parse().map(Value::I32).map_err(|_| invalid())
}
