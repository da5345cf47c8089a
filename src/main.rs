use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use owo_colors::OwoColorize;
use tracing_subscriber::EnvFilter;

use aitk::cli::{
    roots_or_cwd, AppContext, AskArgs, Cli, Commands, EditArgs, GatherArgs, PromptArgs,
};
use aitk::core::gateway::{HttpModelClient, ModelClient};
use aitk::core::{exit_code_for, gather, run_edit_session, EngineError, ProjectSnapshot};
use aitk::infra::config::{load_config, Config};

fn main() -> ExitCode {
    // AITK_LOG=debug etc.; silent by default
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("AITK_LOG").unwrap_or_else(|_| EnvFilter::new("off")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let ctx = AppContext::from_cli(&cli);

    match run(cli, &ctx) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = e
                .downcast_ref::<EngineError>()
                .map(exit_code_for)
                .unwrap_or(5);
            if ctx.no_color {
                eprintln!("error: {e:#}");
            } else {
                eprintln!("{} {e:#}", "error:".red().bold());
            }
            ExitCode::from(code as u8)
        }
    }
}

fn run(cli: Cli, ctx: &AppContext) -> Result<()> {
    let config = load_config()?;

    match cli.command {
        Commands::Edit(args) => edit(args, &config, ctx),
        Commands::Ask(args) => ask(args, &config),
        Commands::Prompt(args) => prompt(args, &config),
        Commands::Cat(args) => print_gathered(gather::contents_text, args, &config),
        Commands::Ls(args) => print_gathered(gather::tree_text, args, &config),
        Commands::Types(args) => print_gathered(gather::signatures_text, args, &config),
        Commands::Init(args) => aitk::infra::config_init(args, ctx),
        Commands::Completions(args) => aitk::completion::run(args),
    }
}

fn edit(args: EditArgs, config: &Config, ctx: &AppContext) -> Result<()> {
    let roots = roots_or_cwd(&args.roots);
    let client = HttpModelClient::new(&config.model).map_err(EngineError::ModelUnavailable)?;
    let summary = run_edit_session(&roots, &args.instruction, &client, config, ctx)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    if let Some(preview) = &summary.preview {
        print!("{preview}");
    }
    if !ctx.quiet {
        let verb = if summary.dry_run { "would apply" } else { "applied" };
        println!(
            "{verb}: {} created, {} replaced, {} edited, {} deleted, {} renamed, {} unchanged",
            summary.created,
            summary.replaced,
            summary.edited,
            summary.deleted,
            summary.renamed,
            summary.skipped
        );
    }
    Ok(())
}

fn ask(args: AskArgs, config: &Config) -> Result<()> {
    let roots = roots_or_cwd(&args.roots);
    let snapshot = ProjectSnapshot::build(&roots, config)?;
    let client = HttpModelClient::new(&config.model).map_err(EngineError::ModelUnavailable)?;

    let prompt = format!(
        "Answer the question using the project snapshot below.\n\n\
         # Project snapshot\n\n{}\n# Question\n\n{}\n",
        snapshot.serialize(),
        args.question
    );
    let answer = client
        .invoke(&prompt)
        .map_err(EngineError::ModelUnavailable)?;
    println!("{}", answer.trim());
    Ok(())
}

/// Ask the model to draft an edit instruction for the given goal.
fn prompt(args: PromptArgs, config: &Config) -> Result<()> {
    let roots = roots_or_cwd(&args.roots);
    let snapshot = ProjectSnapshot::build(&roots, config)?;
    let client = HttpModelClient::new(&config.model).map_err(EngineError::ModelUnavailable)?;

    let request = format!(
        "Write a clear, specific instruction that could be given to an automated \
         code editor to accomplish the goal below. Reply with the instruction text only.\n\n\
         # Project snapshot\n\n{}\n# Goal\n\n{}\n",
        snapshot.serialize(),
        args.instruction
    );
    let answer = client
        .invoke(&request)
        .map_err(EngineError::ModelUnavailable)?;
    println!("{}", answer.trim());
    Ok(())
}

fn print_gathered(
    render: fn(&[PathBuf], &Config) -> Result<String>,
    args: GatherArgs,
    config: &Config,
) -> Result<()> {
    let dirs = roots_or_cwd(&args.dirs);
    print!("{}", render(&dirs, config)?);
    Ok(())
}
