pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(
    name = "dataagent",
    about = "DataAgent operator CLI",
    long_about = "Operate the DataAgent query runtime: migrations, config inspection, readiness checks, conversation history, and schema prompt previews.",
    after_help = "Examples:\n  dataagent doctor --json\n  dataagent history show thread-42\n  dataagent schema-prompt --schema shop.json --instruction \"orders per customer\""
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, LLM settings, and database and datasource connectivity")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Show or clear the stored conversation history of a thread")]
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },
    #[command(about = "Render the compressed schema prompt for a schema snapshot")]
    SchemaPrompt {
        #[arg(long, help = "Path to a JSON schema snapshot")]
        schema: PathBuf,
        #[arg(long, help = "Step instruction used for smart filtering")]
        instruction: Option<String>,
        #[arg(long, value_enum, default_value_t = PromptMode::Auto)]
        mode: PromptMode,
    },
}

#[derive(Debug, Subcommand)]
enum HistoryAction {
    #[command(about = "List committed turns in sequence order")]
    Show { thread_id: String },
    #[command(about = "Delete every committed turn of the thread")]
    Clear { thread_id: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum PromptMode {
    /// Smart filtering when an instruction is given, otherwise the whole schema.
    Auto,
    None,
    Smart,
    Full,
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::History { action: HistoryAction::Show { thread_id } } => {
            commands::history::show(&thread_id)
        }
        Command::History { action: HistoryAction::Clear { thread_id } } => {
            commands::history::clear(&thread_id)
        }
        Command::SchemaPrompt { schema, instruction, mode } => {
            commands::schema_prompt::run(&schema, instruction.as_deref(), mode)
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
