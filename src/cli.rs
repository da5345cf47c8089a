//! Command-line surface: argument types and the shared per-invocation
//! context threaded through every command.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(
    name = "aitk",
    version,
    about = "AI-instructed edit engine for local source trees",
    propagate_version = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Suppress progress output and non-essential messages
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Show what would change without writing anything
    #[arg(long, short = 'n', global = true)]
    pub dry_run: bool,
}

/// Flags every command sees, derived once from the global arguments.
#[derive(Debug, Clone, Copy)]
pub struct AppContext {
    pub quiet: bool,
    pub no_color: bool,
    pub dry_run: bool,
}

impl AppContext {
    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            quiet: cli.quiet,
            no_color: cli.no_color || std::env::var_os("NO_COLOR").is_some(),
            dry_run: cli.dry_run,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run an instruction through the model and apply the resulting edits
    Edit(EditArgs),

    /// Ask the model a question about the gathered context (read-only)
    Ask(AskArgs),

    /// Ask the model to draft an edit instruction for a goal
    Prompt(PromptArgs),

    /// Print the contents of every gathered file
    Cat(GatherArgs),

    /// Print the gathered file tree
    Ls(GatherArgs),

    /// Print a signature scan of the gathered source files
    Types(GatherArgs),

    /// Write a default aitk.toml into a directory
    Init(InitArgs),

    /// Generate shell completion scripts
    Completions(CompletionsArgs),
}

#[derive(Debug, Args)]
pub struct EditArgs {
    /// The instruction describing what to change
    pub instruction: String,

    /// Directories to gather and edit (defaults to the current directory).
    /// With several roots, plan paths are prefixed with each root's name.
    #[arg(long = "root", value_name = "DIR")]
    pub roots: Vec<PathBuf>,

    /// Emit the session summary as JSON on stdout
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct AskArgs {
    /// The question to ask
    pub question: String,

    /// Directories to gather as context (defaults to the current directory)
    #[arg(long = "root", value_name = "DIR")]
    pub roots: Vec<PathBuf>,
}

#[derive(Debug, Args)]
pub struct PromptArgs {
    /// The goal the drafted instruction should accomplish
    pub instruction: String,

    /// Directories to gather as context (defaults to the current directory)
    #[arg(long = "root", value_name = "DIR")]
    pub roots: Vec<PathBuf>,
}

#[derive(Debug, Args)]
pub struct GatherArgs {
    /// Directories to gather (defaults to the current directory)
    #[arg(value_name = "DIR")]
    pub dirs: Vec<PathBuf>,
}

#[derive(Debug, Args)]
pub struct InitArgs {
    /// Directory to write aitk.toml into
    #[arg(default_value = ".")]
    pub path: PathBuf,

    /// Overwrite an existing config file
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Target shell
    #[arg(value_enum)]
    pub shell: Shell,

    /// Print the script to stdout instead of writing a file
    #[arg(long)]
    pub stdout: bool,

    /// Directory to write the completion script into
    #[arg(long, value_name = "DIR")]
    pub out_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    #[value(name = "powershell")]
    PowerShell,
    Elvish,
}

/// Default the root list to the current directory when none is given.
/// Tilde prefixes in user-supplied roots are expanded.
pub fn roots_or_cwd(roots: &[PathBuf]) -> Vec<PathBuf> {
    if roots.is_empty() {
        return vec![PathBuf::from(".")];
    }
    roots
        .iter()
        .map(|p| PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).into_owned()))
        .collect()
}
