use clap::{Parser, Subcommand};
use code_sandbox::{Error, ExecutionRequest, ExecutionResult, Executor, SandboxConfig};
use serde::Serialize;
use std::{
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
    process,
};

const EXIT_INTERNAL: i32 = 1;
const EXIT_BAD_REQUEST: i32 = 2;
// EX_TEMPFAIL from sysexits.h.
const EXIT_CAPACITY: i32 = 75;

/// Run untrusted code under CPU, memory, wall-clock and output ceilings.
#[derive(Debug, Parser)]
#[command(name = "code-sandbox", version)]
struct Cli {
    /// JSON configuration file; SANDBOX_* environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Execute code and print the result as JSON.
    Execute {
        /// Source file; read from stdin when omitted.
        #[arg(long)]
        file: Option<PathBuf>,
        /// File fed to the program's standard input.
        #[arg(long)]
        input: Option<PathBuf>,
        #[arg(long, default_value = "python")]
        language: String,
        /// Read a complete JSON request from stdin instead.
        #[arg(long, conflicts_with_all = ["file", "input", "language"])]
        json: bool,
    },
    /// Run only the static policy filter.
    Check {
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Print the configured limits.
    Health,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            log::error!("{}", e);
            if e.is_retryable() {
                EXIT_CAPACITY
            } else if e.is_internal() {
                EXIT_INTERNAL
            } else {
                EXIT_BAD_REQUEST
            }
        }
    };

    process::exit(code);
}

async fn run(cli: Cli) -> code_sandbox::Result<i32> {
    let config = SandboxConfig::load(cli.config.as_deref())?;
    let executor = Executor::new(config)?;

    match cli.command {
        Commands::Health => {
            print_json(&executor.health())?;
            Ok(0)
        }
        Commands::Check { file } => {
            let code = read_source(file.as_deref())?;
            print_json(&executor.check(&code))?;
            Ok(0)
        }
        Commands::Execute {
            file,
            input,
            language,
            json,
        } => {
            let request = if json {
                let raw = read_source(None)?;
                serde_json::from_str(&raw).map_err(|e| Error::UnableToParseRequest { source: e })?
            } else {
                let mut request = ExecutionRequest::new(read_source(file.as_deref())?);
                request.language = language;
                if let Some(path) = input {
                    request = request.with_input(read_file(&path)?);
                }
                request
            };

            match executor.execute(&request).await {
                Ok(result) => {
                    print_json(&result)?;
                    Ok(0)
                }
                Err(e) if e.is_internal() => {
                    log::error!("{}", e);
                    print_json(&ExecutionResult::internal_error(e.to_string()))?;
                    Ok(EXIT_INTERNAL)
                }
                Err(e) => Err(e),
            }
        }
    }
}

fn read_source(file: Option<&Path>) -> code_sandbox::Result<String> {
    match file {
        Some(path) => read_file(path),
        None => {
            let mut code = String::new();
            io::stdin()
                .read_to_string(&mut code)
                .map_err(|e| Error::UnableToReadInput {
                    path: PathBuf::from("<stdin>"),
                    source: e,
                })?;
            Ok(code)
        }
    }
}

fn read_file(path: &Path) -> code_sandbox::Result<String> {
    fs::read_to_string(path).map_err(|e| Error::UnableToReadInput {
        path: path.to_path_buf(),
        source: e,
    })
}

fn print_json<T: Serialize>(value: &T) -> code_sandbox::Result<()> {
    let rendered =
        serde_json::to_string_pretty(value).map_err(|e| Error::UnableToSerialize { source: e })?;
    println!("{}", rendered);
    Ok(())
}
