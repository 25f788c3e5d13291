use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::Command;
use stm32prog_core::BoardConfig;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Tasks for the project", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the project
    Build,
    /// Run the test suite
    Test,
    /// Run the CLI
    Run {
        /// Arguments passed to the CLI
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
    /// Write the default simulated board description
    BoardConfig {
        #[arg(default_value = "board.toml")]
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build => {
            println!("Building project...");
            let status = Command::new("cargo").arg("build").status()?;
            if !status.success() {
                anyhow::bail!("Build failed");
            }
        }
        Commands::Test => {
            println!("Running tests...");
            let status = Command::new("cargo").arg("test").arg("--workspace").status()?;
            if !status.success() {
                anyhow::bail!("Tests failed");
            }
        }
        Commands::Run { args } => {
            println!("Running CLI...");
            let status = Command::new("cargo")
                .arg("run")
                .arg("-p")
                .arg("stm32prog-cli")
                .arg("--")
                .args(args)
                .status()?;
            if !status.success() {
                anyhow::bail!("Run failed");
            }
        }
        Commands::BoardConfig { path } => {
            BoardConfig::default().save_to_file(path)?;
            println!("Board description written to {}", path.display());
        }
    }

    Ok(())
}
