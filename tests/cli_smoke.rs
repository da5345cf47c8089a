//! CLI smoke tests. Nothing here touches the network: the edit path is only
//! exercised up to the missing-API-key abort.

use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

fn aitk() -> Command {
    let mut cmd = Command::cargo_bin("aitk").unwrap();
    cmd.env_remove("OPENAI_API_KEY");
    cmd
}

#[test]
fn help_lists_commands() {
    aitk()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("edit"))
        .stdout(predicate::str::contains("completions"));
}

#[test]
fn ls_prints_a_tree() {
    let tmp = tempdir().unwrap();
    fs::create_dir_all(tmp.path().join("src")).unwrap();
    fs::write(tmp.path().join("src/lib.rs"), "pub fn x() {}\n").unwrap();

    aitk()
        .arg("ls")
        .arg(tmp.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("src"))
        .stdout(predicate::str::contains("lib.rs"));
}

#[test]
fn cat_prints_fenced_contents() {
    let tmp = tempdir().unwrap();
    fs::write(tmp.path().join("hello.txt"), "hello world\n").unwrap();

    aitk()
        .arg("cat")
        .arg(tmp.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("=== hello.txt ==="))
        .stdout(predicate::str::contains("hello world"));
}

#[test]
fn types_scans_signatures() {
    let tmp = tempdir().unwrap();
    fs::write(
        tmp.path().join("mod.rs"),
        "pub fn exported() {}\nlet not_a_decl = 1;\n",
    )
    .unwrap();

    aitk()
        .arg("types")
        .arg(tmp.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("pub fn exported()"))
        .stdout(predicate::str::contains("not_a_decl").not());
}

#[test]
fn invalid_root_exits_with_code_4() {
    aitk()
        .arg("ls")
        .arg("/definitely/not/a/real/directory")
        .assert()
        .code(4)
        .stderr(predicate::str::contains("invalid root"));
}

#[test]
fn edit_without_api_key_exits_with_code_6() {
    let tmp = tempdir().unwrap();
    fs::write(tmp.path().join("a.txt"), "a\n").unwrap();

    aitk()
        .current_dir(tmp.path())
        .args(["edit", "do something"])
        .assert()
        .code(6)
        .stderr(predicate::str::contains("OPENAI_API_KEY"));
}

#[test]
fn init_writes_config_once() {
    let tmp = tempdir().unwrap();

    aitk()
        .current_dir(tmp.path())
        .arg("init")
        .assert()
        .success();
    assert!(tmp.path().join("aitk.toml").exists());

    // A second init without --force must refuse
    aitk()
        .current_dir(tmp.path())
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--force"));
}

#[test]
fn completions_print_to_stdout() {
    aitk()
        .args(["completions", "bash", "--stdout"])
        .assert()
        .success()
        .stdout(predicate::str::contains("aitk"));
}

#[test]
fn prompt_without_api_key_exits_with_code_6() {
    let tmp = tempdir().unwrap();
    fs::write(tmp.path().join("a.txt"), "a\n").unwrap();

    aitk()
        .args(["prompt", "make it faster", "--root"])
        .arg(tmp.path())
        .assert()
        .code(6)
        .stderr(predicate::str::contains("OPENAI_API_KEY"));
}
