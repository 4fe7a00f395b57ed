mod cli;
mod observability;

use std::path::PathBuf;
use std::process;

use clap::Parser;

use devsandbox_core::config::Config;
use devsandbox_core::LauncherError;
use devsandbox_sandbox::{CompileOutput, LaunchOptions, Orchestrator};

use cli::Cli;

fn main() {
    observability::init_tracing();
    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("devsandbox: {err}");
            let mut source = std::error::Error::source(&err);
            while let Some(cause) = source {
                eprintln!("  caused by: {cause}");
                source = cause.source();
            }
            process::exit(err.exit_code());
        }
    }
}

fn run(cli: Cli) -> Result<i32, LauncherError> {
    let project_dir = match cli.project {
        Some(dir) => dir,
        None => current_dir()?,
    };

    let mut config = Config::load(&project_dir)?;
    if cli.proxy {
        config.proxy.enabled = true;
    }
    if let Some(port) = cli.proxy_port {
        config.proxy.port = port;
    }

    let mut orchestrator = Orchestrator::new(config, &project_dir)?;
    if cli.info {
        let output = orchestrator.plan()?;
        print_plan(&orchestrator, &output);
        return Ok(0);
    }

    orchestrator.run(&LaunchOptions {
        command: cli.command,
    })
}

fn current_dir() -> Result<PathBuf, LauncherError> {
    std::env::current_dir().map_err(|e| LauncherError::ConfigInvalid {
        path: ".".into(),
        message: format!("cannot determine the current directory: {e}"),
    })
}

fn print_plan(orchestrator: &Orchestrator, output: &CompileOutput) {
    let identity = orchestrator.identity();
    println!("project:      {}", identity.project_dir.display());
    println!("sandbox home: {}", identity.sandbox_home.display());
    println!("data dir:     {}", identity.data_dir.display());
    println!("fingerprint:  {}", output.fingerprint);
    if !output.warnings.is_empty() {
        println!("warnings:");
        for warning in &output.warnings {
            println!("  {warning}");
        }
    }
    println!("operations:");
    for op in &output.ops {
        println!("  {op}");
    }
}
