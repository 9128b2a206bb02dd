//! Tungsten CLI and REPL
//!
//! Usage:
//!   tungsten run <file.tn> [function] [args...]   - Call a function (default `main`)
//!   tungsten check <file.tn>                      - Compile only
//!   tungsten disasm <file.tn>                     - Print the bytecode
//!   tungsten repl <file.tn>                       - Call functions interactively
//!   tungsten help                                 - Show help message
//!
//! Set `TUNGSTEN_LOG=debug` (or `trace`) to see compiler and VM logging.

use std::env;
use std::fs;
use std::process;

use colored::Colorize;
use log::{Level, LevelFilter, Log, Metadata, Record};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use tungsten::{compile, HostError, ParamType, Registry, Script, Value, VmConfig, VERSION};

struct CliLogger;

impl Log for CliLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = match record.level() {
            Level::Error => "error".red().bold(),
            Level::Warn => "warn".yellow().bold(),
            Level::Info => "info".green(),
            Level::Debug => "debug".blue(),
            Level::Trace => "trace".dimmed(),
        };
        eprintln!("{} {}", tag, record.args());
    }

    fn flush(&self) {}
}

static LOGGER: CliLogger = CliLogger;

fn init_logging() {
    let level = env::var("TUNGSTEN_LOG")
        .ok()
        .and_then(|value| value.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Off);
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

/// Command line after `--steps` has been pulled out
struct Options {
    positional: Vec<String>,
    config: VmConfig,
}

fn parse_options(args: &[String]) -> Options {
    let mut positional = Vec::new();
    let mut config = VmConfig::default();
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        if arg == "--steps" {
            match iter.next().and_then(|n| n.parse::<u64>().ok()) {
                Some(limit) => config.step_limit = Some(limit),
                None => {
                    eprintln!("{}: --steps needs a number", "error".red());
                    process::exit(1);
                }
            }
        } else {
            positional.push(arg.clone());
        }
    }

    Options { positional, config }
}

fn main() {
    init_logging();

    let args: Vec<String> = env::args().skip(1).collect();
    let options = parse_options(&args);
    let positional = &options.positional;

    let Some(command) = positional.first() else {
        print_help();
        return;
    };

    match command.as_str() {
        "run" => {
            let path = require_file(positional, "run");
            let function = positional.get(2).map(String::as_str).unwrap_or("main");
            let call_args: Vec<Value> = positional.iter().skip(3).map(|a| parse_value(a)).collect();
            run_file(path, function, &call_args, options.config.clone());
        }
        "check" => check_file(require_file(positional, "check")),
        "disasm" => disasm_file(require_file(positional, "disasm")),
        "repl" => run_repl(require_file(positional, "repl"), options.config.clone()),
        "help" | "--help" | "-h" => print_help(),
        "version" | "--version" | "-v" => println!("Tungsten {}", VERSION),
        _ => {
            // Assume it's a file
            if command.ends_with(".tn") {
                run_file(command, "main", &[], options.config.clone());
            } else {
                eprintln!("{}: unknown command '{}'", "error".red(), command);
                print_help();
                process::exit(1);
            }
        }
    }
}

fn require_file<'a>(positional: &'a [String], command: &str) -> &'a str {
    match positional.get(1) {
        Some(path) => path,
        None => {
            eprintln!("{}: missing file argument", "error".red());
            eprintln!("Usage: tungsten {} <file.tn>", command);
            process::exit(1);
        }
    }
}

fn print_help() {
    println!("{}", "Tungsten".cyan().bold());
    println!("A small embeddable scripting language");
    println!("{} {}\n", "Version".cyan(), VERSION);
    println!("{}", "USAGE:".yellow());
    println!("  tungsten run <file.tn> [function] [args...]   Call a function (default main)");
    println!("  tungsten check <file.tn>                      Compile and report errors");
    println!("  tungsten disasm <file.tn>                     Print the compiled bytecode");
    println!("  tungsten repl <file.tn>                       Call functions interactively");
    println!("  tungsten help                                 Show this help message");
    println!("  tungsten version                              Show version\n");
    println!("{}", "OPTIONS:".yellow());
    println!("  --steps <n>              Abort after n instructions");
    println!("  TUNGSTEN_LOG=<level>     Log level: error, warn, info, debug, trace\n");
    println!("{}", "HOST TYPES:".yellow());
    println!("  Console:Log(value)       Print a value");
    println!("  Math:Max(a, b)           Also Min, Abs, Sqrt and Math:PI");
    println!("  new Range(start, end)    Integer range for `for` loops");
}

fn read_source(path: &str) -> String {
    match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            eprintln!("{}: cannot read file '{}': {}", "error".red(), path, e);
            process::exit(1);
        }
    }
}

/// Host types available to scripts run from the command line
fn demo_registry() -> Registry {
    let mut registry = Registry::new();

    registry
        .define("Console")
        .static_method("Log", &[ParamType::Any], |args| {
            println!("{}", args[0]);
            Ok(Value::Null)
        });

    registry
        .define("Math")
        .static_field("PI", Value::Float(std::f32::consts::PI))
        .static_method("Max", &[ParamType::Int, ParamType::Int], |args| {
            Ok(Value::Int(int_arg(args, 0)?.max(int_arg(args, 1)?)))
        })
        .static_method("Max", &[ParamType::Number, ParamType::Number], |args| {
            Ok(Value::Float(float_arg(args, 0)?.max(float_arg(args, 1)?)))
        })
        .static_method("Min", &[ParamType::Int, ParamType::Int], |args| {
            Ok(Value::Int(int_arg(args, 0)?.min(int_arg(args, 1)?)))
        })
        .static_method("Min", &[ParamType::Number, ParamType::Number], |args| {
            Ok(Value::Float(float_arg(args, 0)?.min(float_arg(args, 1)?)))
        })
        .static_method("Abs", &[ParamType::Int], |args| {
            Ok(Value::Int(int_arg(args, 0)?.wrapping_abs()))
        })
        .static_method("Abs", &[ParamType::Float], |args| {
            Ok(Value::Float(float_arg(args, 0)?.abs()))
        })
        .static_method("Sqrt", &[ParamType::Number], |args| {
            Ok(Value::Float(float_arg(args, 0)?.sqrt()))
        });

    registry
}

fn int_arg(args: &[Value], index: usize) -> Result<i32, HostError> {
    args.get(index)
        .and_then(Value::as_int)
        .ok_or_else(|| HostError::Failed(format!("argument {} must be an int", index + 1)))
}

fn float_arg(args: &[Value], index: usize) -> Result<f32, HostError> {
    args.get(index)
        .and_then(Value::as_float)
        .ok_or_else(|| HostError::Failed(format!("argument {} must be a number", index + 1)))
}

/// Command-line arguments become ints, floats, bools, null or strings
fn parse_value(arg: &str) -> Value {
    if let Ok(n) = arg.parse::<i32>() {
        return Value::Int(n);
    }
    if let Ok(n) = arg.parse::<f32>() {
        return Value::Float(n);
    }
    match arg {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "null" => Value::Null,
        _ => Value::String(arg.trim_matches('"').to_string()),
    }
}

fn load_script(path: &str, config: VmConfig) -> Script {
    let source = read_source(path);
    match Script::with_config(&source, Box::new(demo_registry()), config) {
        Ok(script) => script,
        Err(diagnostics) => {
            eprintln!("{}", diagnostics.render().red());
            process::exit(1);
        }
    }
}

fn run_file(path: &str, function: &str, args: &[Value], config: VmConfig) {
    let mut script = load_script(path, config);

    match script.call(function, args) {
        Ok(Value::Null) => {}
        Ok(value) => println!("{}", value),
        Err(e) => {
            eprintln!("{}", e.to_string().red());
            process::exit(1);
        }
    }
}

fn check_file(path: &str) {
    let source = read_source(path);
    match compile(&source) {
        Ok(program) => println!(
            "{} {} function(s), {} global(s)",
            "ok:".green().bold(),
            program.function_names().len(),
            program.global_names().len()
        ),
        Err(diagnostics) => {
            eprintln!("{}", diagnostics.render().red());
            eprintln!("{} {} error(s)", "failed:".red().bold(), diagnostics.error_count());
            process::exit(1);
        }
    }
}

fn disasm_file(path: &str) {
    let source = read_source(path);
    match compile(&source) {
        Ok(program) => print!("{}", program.disassemble()),
        Err(diagnostics) => {
            eprintln!("{}", diagnostics.render().red());
            process::exit(1);
        }
    }
}

fn run_repl(path: &str, config: VmConfig) {
    let mut script = load_script(path, config);

    println!(
        "{} {} - {}",
        "Tungsten".cyan().bold(),
        VERSION.cyan(),
        path.dimmed()
    );
    println!(
        "Functions: {}",
        script.program().function_names().join(", ").yellow()
    );
    println!("Type {} to exit, {} for help\n", "exit".yellow(), "help".yellow());

    let mut rl = match DefaultEditor::new() {
        Ok(rl) => rl,
        Err(e) => {
            eprintln!("{}: cannot start REPL: {}", "error".red(), e);
            process::exit(1);
        }
    };

    loop {
        match rl.readline(&format!("{} ", "tn>".green().bold())) {
            Ok(line) => {
                let line = line.trim();

                if line.is_empty() {
                    continue;
                }

                let _ = rl.add_history_entry(line);

                // Handle special commands
                match line {
                    "exit" | "quit" => {
                        println!("{}", "Goodbye!".cyan());
                        break;
                    }
                    "help" => {
                        print_repl_help();
                        continue;
                    }
                    ":disasm" => {
                        print!("{}", script.program().disassemble());
                        continue;
                    }
                    ":globals" => {
                        for name in script.program().global_names() {
                            let value = script.global(name).cloned().unwrap_or(Value::Null);
                            println!("  {} = {}", name.yellow(), value);
                        }
                        continue;
                    }
                    _ => {}
                }

                let mut words = line.split_whitespace();
                let Some(function) = words.next() else {
                    continue;
                };
                let args: Vec<Value> = words.map(parse_value).collect();

                match script.call(function, &args) {
                    Ok(Value::Null) => {}
                    Ok(value) => println!("{} {}", "=>".dimmed(), value.to_string().cyan()),
                    Err(e) => eprintln!("{}", e.to_string().red()),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("{}", "^C".dimmed());
            }
            Err(ReadlineError::Eof) => {
                println!("{}", "Goodbye!".cyan());
                break;
            }
            Err(err) => {
                eprintln!("{}: {:?}", "error".red(), err);
                break;
            }
        }
    }
}

fn print_repl_help() {
    println!("{}", "REPL Commands:".yellow());
    println!("  <function> [args...]   Call a script function");
    println!("  :disasm                Show the compiled bytecode");
    println!("  :globals               Show global values");
    println!("  exit, quit             Exit the REPL");
    println!("  help                   Show this help\n");
    println!("{}", "Examples:".yellow());
    println!("  main");
    println!("  add 2 3");
    println!("  greet \"world\"");
}
