//! tdl - call native library functions from the command line
//!
//! Thin front end over the `typed_dl` runtime: one-off calls, manifest checks
//! and the type vocabulary.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use typed_dl::ffi::{Runtime, TypeTag, Value};
use typed_dl::Manifest;

#[derive(Parser)]
#[command(name = "tdl")]
#[command(version)]
#[command(
    about = "Call functions in shared libraries through declared signatures",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a library, declare one symbol and call it once
    Call {
        /// Library path or name (e.g. libc.so.6, m)
        #[arg(value_name = "LIBRARY")]
        library: String,

        /// Exported symbol to call
        #[arg(value_name = "SYMBOL")]
        symbol: String,

        /// Argument as TAG:VALUE (int:-5, double:1.5, string:hello, pointer:null)
        #[arg(short, long = "arg", value_name = "TAG:VALUE")]
        args: Vec<String>,

        /// Return type
        #[arg(short, long, default_value = "void")]
        ret: String,
    },

    /// Bind every library in a manifest and report what resolved
    Check {
        /// Manifest file (default: typed-dl.toml found from the current directory up)
        #[arg(value_name = "MANIFEST")]
        manifest: Option<PathBuf>,
    },

    /// List the recognized type names
    Tags,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Call {
            library,
            symbol,
            args,
            ret,
        } => cmd_call(&library, &symbol, &args, &ret),
        Commands::Check { manifest } => cmd_check(manifest.as_ref()),
        Commands::Tags => cmd_tags(),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn cmd_call(library: &str, symbol: &str, raw_args: &[String], ret: &str) -> Result<ExitCode> {
    let runtime = Runtime::new();

    let mut arg_types = Vec::with_capacity(raw_args.len());
    let mut values = Vec::with_capacity(raw_args.len());
    for raw in raw_args {
        let (tag, value) = parse_arg(&runtime, raw)?;
        arg_types.push(tag.name());
        values.push(value);
    }

    let handle = runtime
        .open(library)
        .with_context(|| format!("opening '{}'", library))?;
    let function = runtime
        .declare(&handle, symbol, &arg_types, ret)
        .with_context(|| format!("declaring '{}'", symbol))?;

    let result = function
        .call(&values)
        .with_context(|| format!("calling {}", function))?;
    if !result.is_void() {
        println!("{}", result);
    }

    runtime.close(&handle);
    Ok(ExitCode::SUCCESS)
}

/// Parse one `TAG:VALUE` argument
fn parse_arg(runtime: &Runtime, raw: &str) -> Result<(TypeTag, Value)> {
    let Some((tag, text)) = raw.split_once(':') else {
        bail!("argument '{}' is not of the form TAG:VALUE", raw);
    };
    let tag = TypeTag::parse(tag)?;

    let value = match tag {
        TypeTag::Int32 => Value::Int(
            text.parse()
                .with_context(|| format!("'{}' is not an integer", text))?,
        ),
        TypeTag::Float64 => Value::Float(
            text.parse()
                .with_context(|| format!("'{}' is not a number", text))?,
        ),
        TypeTag::Utf8String => Value::Str(text.to_string()),
        TypeTag::Pointer if text == "null" => Value::Pointer(runtime.null_pointer()),
        TypeTag::Pointer => bail!("only 'pointer:null' can be given on the command line"),
        TypeTag::Void => bail!("void is not a valid argument type"),
    };
    Ok((tag, value))
}

fn cmd_check(path: Option<&PathBuf>) -> Result<ExitCode> {
    let manifest = match path {
        Some(path) => Manifest::load(path)
            .with_context(|| format!("loading manifest '{}'", path.display()))?,
        None => {
            let cwd = std::env::current_dir().context("reading current directory")?;
            Manifest::find_and_load(&cwd).context("searching for typed-dl.toml")?
        }
    };

    if manifest.libraries.is_empty() {
        println!("no libraries listed");
        return Ok(ExitCode::SUCCESS);
    }

    let runtime = Runtime::with_config(&manifest.runtime_config());
    let mut failed = false;

    for spec in &manifest.libraries {
        match runtime.bind_library(spec) {
            Ok(bindings) => {
                println!("{}: {}", spec.name, bindings.handle().path().display());
                for function in bindings.functions() {
                    println!("  ok       {}", function);
                }
                for missing in bindings.missing() {
                    println!("  missing  {}", missing);
                }
            }
            Err(e) => {
                println!("{}: {}", spec.name, e);
                failed = true;
            }
        }
    }

    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn cmd_tags() -> Result<ExitCode> {
    for tag in TypeTag::ALL {
        let position = if tag.is_argument() {
            "argument, return"
        } else {
            "return"
        };
        println!("{:<8} {}", tag.name(), position);
    }
    Ok(ExitCode::SUCCESS)
}
