use clap::{Parser, Subcommand};
use std::fs;
use std::process::ExitCode;
use watc::script::{self, Command};

#[derive(Parser)]
#[command(name = "watc")]
#[command(about = "WebAssembly text format front-end")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a WAT module and print its structure
    Dump {
        /// Path to the .wat file
        file: String,
    },

    /// Parse a script and summarise its directives
    Check {
        /// Path to the .wast file
        file: String,
    },
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Dump { file } => dump_module(&file),
        Commands::Check { file } => check_script(&file),
    }
}

fn dump_module(file: &str) -> ExitCode {
    let source = match fs::read_to_string(file) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error reading {}: {}", file, e);
            return ExitCode::FAILURE;
        }
    };

    match watc::wat::parse(&source) {
        Ok(module) => {
            print!("{}", module);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error parsing {}: {}", file, e);
            ExitCode::FAILURE
        }
    }
}

fn check_script(file: &str) -> ExitCode {
    let source = match fs::read_to_string(file) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error reading {}: {}", file, e);
            return ExitCode::FAILURE;
        }
    };

    let script = match script::parse_script(&source) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error parsing {}: {}", file, e);
            return ExitCode::FAILURE;
        }
    };

    let mut modules = 0usize;
    let mut registers = 0usize;
    let mut actions = 0usize;
    let mut assertions = 0usize;
    let mut other = 0usize;
    for command in &script.commands {
        match command {
            Command::Module { .. } => modules += 1,
            Command::Register { .. } => registers += 1,
            Command::Action { .. } => actions += 1,
            Command::AssertReturn { .. }
            | Command::AssertReturnCanonicalNan { .. }
            | Command::AssertReturnArithmeticNan { .. }
            | Command::AssertTrap { .. }
            | Command::AssertModuleTrap { .. }
            | Command::AssertMalformed { .. }
            | Command::AssertInvalid { .. }
            | Command::AssertUnlinkable { .. } => assertions += 1,
            Command::AssertExhaustion { .. } | Command::Skipped { .. } => other += 1,
        }
    }

    println!(
        "{}: {} directives ({} modules, {} registers, {} actions, {} assertions, {} other)",
        file,
        script.commands.len(),
        modules,
        registers,
        actions,
        assertions,
        other
    );
    ExitCode::SUCCESS
}
