use std::process::ExitCode;

use clap::{Parser, Subcommand};

use tandem::commands;
use tandem::commands::audit::AuditArgs;
use tandem::commands::cancel::CancelArgs;
use tandem::commands::init::InitArgs;
use tandem::commands::intake::IntakeArgs;
use tandem::commands::reply::ReplyArgs;
use tandem::commands::resume::ResumeArgs;
use tandem::commands::status::StatusArgs;
use tandem::{error, telemetry};

#[derive(Debug, Parser)]
#[command(
    name = "tandem",
    version,
    about = "Paired generate-and-review orchestration for automated change requests"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Authenticate a webhook event and drive the issue's workflow
    Intake(IntakeArgs),
    /// Answer a clarification request and resume the workflow
    Reply(ReplyArgs),
    /// Advance every interrupted workflow
    Resume(ResumeArgs),
    /// Show workflow status
    Status(StatusArgs),
    /// Cancel an in-flight workflow
    Cancel(CancelArgs),
    /// Print the iteration journal for an issue
    Audit(AuditArgs),
    /// Write a default .tandem.toml
    Init(InitArgs),
    /// Print the JSON Schema for .tandem.toml
    Schema,
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Intake(_) => "intake",
            Self::Reply(_) => "reply",
            Self::Resume(_) => "resume",
            Self::Status(_) => "status",
            Self::Cancel(_) => "cancel",
            Self::Audit(_) => "audit",
            Self::Init(_) => "init",
            Self::Schema => "schema",
        }
    }
}

fn main() -> ExitCode {
    let _telemetry = telemetry::init();

    let cli = Cli::parse();

    let _span = tracing::info_span!("command", name = cli.command.name()).entered();

    let result = match cli.command {
        Commands::Intake(args) => args.execute(),
        Commands::Reply(args) => args.execute(),
        Commands::Resume(args) => args.execute(),
        Commands::Status(args) => args.execute(),
        Commands::Cancel(args) => args.execute(),
        Commands::Audit(args) => args.execute(),
        Commands::Init(args) => args.execute(),
        Commands::Schema => commands::schema::run_schema(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(exit_err) = e.downcast_ref::<error::ExitError>() {
                eprintln!("error: {exit_err}");
                exit_err.exit_code()
            } else {
                eprintln!("error: {e:#}");
                ExitCode::FAILURE
            }
        }
    }
}
