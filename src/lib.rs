//! **aitk** - AI-instructed edit engine for local source trees
//!
//! Gathers a bounded snapshot of one or more directories, sends it with an
//! instruction to an OpenAI-compatible model, parses the strict edit grammar
//! the model replies in, and applies the edits atomically with conflict
//! detection and full rollback.

/// Command-line interface with clap integration
pub mod cli;

/// Shell completion generation
pub mod completion;

/// Core engine - snapshot, gateway, plan, apply, session
pub mod core {
    /// Engine error taxonomy and exit-code mapping
    pub mod errors;
    pub use errors::{EngineError, exit_code_for};

    /// Context Builder: bounded read-only project snapshots with fingerprints
    pub mod snapshot;
    pub use snapshot::{Fingerprint, ProjectSnapshot, Roots, fingerprint, normalize_text};

    /// Model Gateway: prompt assembly and the chat-completions transport
    pub mod gateway;
    pub use gateway::{HttpModelClient, ModelClient, ModelError, OUTPUT_CONTRACT};

    /// Edit Plan Parser: strict grammar over model responses
    pub mod plan;
    pub use plan::{EditOperation, EditPlan, ParseError, parse_plan, render_plan};

    /// Edit Applier: two-phase conflict check, atomic writes, rollback
    pub mod apply;
    pub use apply::{ApplyOptions, ApplyReport, apply_plan};

    /// Edit Session Controller: instruction to committed tree
    pub mod session;
    pub use session::{SessionSummary, run_edit_session};

    /// Read-only context rendering for the inspection commands
    pub mod gather;
}

/// Infrastructure - Configuration, I/O, and directory walking
pub mod infra {
    /// Configuration management with TOML files and AITK_ env overrides
    pub mod config;
    pub use config::{Config, init as config_init, load_config};

    /// Memory-mapped file I/O and atomic writes
    pub mod io;
    pub use io::{FileContent, read_file_smart, write_atomic};

    /// Gitignore-aware directory walking
    pub mod walk;
    pub use walk::FileWalker;
}

// Strategic re-exports for clean CLI interface
pub use cli::{AppContext, Cli, Commands};
pub use crate::core::{EngineError, ModelClient, ProjectSnapshot, exit_code_for, run_edit_session};
pub use crate::infra::{Config, FileWalker, load_config};
