//! End-to-end edit sessions driven by a scripted model client.

use std::cell::RefCell;
use std::fs;
use std::path::Path;

use aitk::cli::AppContext;
use aitk::core::gateway::{ModelClient, ModelError};
use aitk::core::{run_edit_session, EngineError};
use aitk::infra::Config;
use tempfile::tempdir;

struct ScriptedClient<F: Fn(&str) -> Result<String, ModelError>> {
    respond: F,
    calls: RefCell<usize>,
}

impl<F: Fn(&str) -> Result<String, ModelError>> ModelClient for ScriptedClient<F> {
    fn invoke(&self, prompt: &str) -> Result<String, ModelError> {
        *self.calls.borrow_mut() += 1;
        (self.respond)(prompt)
    }
}

fn scripted<F: Fn(&str) -> Result<String, ModelError>>(respond: F) -> ScriptedClient<F> {
    ScriptedClient {
        respond,
        calls: RefCell::new(0),
    }
}

fn ctx() -> AppContext {
    AppContext {
        quiet: true,
        no_color: true,
        dry_run: false,
    }
}

fn write_file(root: &Path, rel: &str, body: &str) {
    let p = root.join(rel);
    if let Some(parent) = p.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(p, body).unwrap();
}

#[test]
fn session_edits_across_multiple_roots() {
    let tmp = tempdir().unwrap();
    let alpha = tmp.path().join("alpha");
    let beta = tmp.path().join("beta");
    write_file(&alpha, "a.txt", "alpha file\n");
    write_file(&beta, "b.txt", "beta file\n");

    // With several roots, the prompt and the plan address files through
    // root-name prefixes.
    let client = scripted(|prompt| {
        assert!(prompt.contains("alpha/a.txt"));
        assert!(prompt.contains("beta/b.txt"));
        Ok("REPLACE: alpha/a.txt\n```\nALPHA\n```\n\nREPLACE: beta/b.txt\n```\nBETA\n```\n"
            .to_string())
    });

    let summary = run_edit_session(
        &[alpha.clone(), beta.clone()],
        "uppercase everything",
        &client,
        &Config::default(),
        &ctx(),
    )
    .unwrap();

    assert_eq!(summary.replaced, 2);
    assert_eq!(fs::read_to_string(alpha.join("a.txt")).unwrap(), "ALPHA");
    assert_eq!(fs::read_to_string(beta.join("b.txt")).unwrap(), "BETA");
}

#[test]
fn session_aborts_when_files_change_while_model_thinks() {
    let tmp = tempdir().unwrap();
    write_file(tmp.path(), "racy.txt", "before\n");

    // The "model" mutates the file before answering, simulating a concurrent
    // editor between snapshot and apply.
    let target = tmp.path().join("racy.txt");
    let client = scripted(move |_| {
        fs::write(&target, "changed behind our back\n").unwrap();
        Ok("REPLACE: racy.txt\n```\nfrom model\n```\n".to_string())
    });

    let err = run_edit_session(
        &[tmp.path().to_path_buf()],
        "rewrite racy.txt",
        &client,
        &Config::default(),
        &ctx(),
    )
    .unwrap_err();

    assert!(matches!(err, EngineError::ConflictDetected { .. }));
    assert_eq!(
        fs::read_to_string(tmp.path().join("racy.txt")).unwrap(),
        "changed behind our back\n",
        "the concurrent edit must survive untouched"
    );
}

#[test]
fn session_gives_up_after_configured_retries() {
    let tmp = tempdir().unwrap();
    write_file(tmp.path(), "a.txt", "a\n");

    let client = scripted(|_| Ok("I would love to help but here is prose".to_string()));
    let mut config = Config::default();
    config.session.parse_retries = 1;

    let err = run_edit_session(
        &[tmp.path().to_path_buf()],
        "edit a",
        &client,
        &config,
        &ctx(),
    )
    .unwrap_err();

    assert!(matches!(err, EngineError::Malformed(_)));
    assert_eq!(*client.calls.borrow(), 2, "one initial attempt plus one retry");
}

#[test]
fn session_rejects_plans_that_escape_the_root() {
    let tmp = tempdir().unwrap();
    write_file(tmp.path(), "safe.txt", "s\n");

    let client = scripted(|_| Ok("CREATE: ../outside.txt\n```\nnope\n```\n".to_string()));
    let mut config = Config::default();
    config.session.parse_retries = 0;

    let err = run_edit_session(
        &[tmp.path().to_path_buf()],
        "try to escape",
        &client,
        &config,
        &ctx(),
    )
    .unwrap_err();

    assert!(matches!(err, EngineError::Malformed(_)));
    assert!(!tmp.path().parent().unwrap().join("outside.txt").exists());
}

#[test]
fn large_files_are_listed_but_not_inlined() {
    let tmp = tempdir().unwrap();
    write_file(tmp.path(), "huge.log", &"x".repeat(500_000));
    write_file(tmp.path(), "small.txt", "tiny\n");

    let client = scripted(|prompt| {
        assert!(
            prompt.contains("huge.log (content omitted)"),
            "oversized file should be demoted to a tree entry"
        );
        assert!(prompt.contains("tiny"));
        Ok("REPLACE: small.txt\n```\nstill tiny\n```\n".to_string())
    });

    let mut config = Config::default();
    config.context.max_bytes = 64 * 1024;
    run_edit_session(
        &[tmp.path().to_path_buf()],
        "touch small",
        &client,
        &config,
        &ctx(),
    )
    .unwrap();
}
