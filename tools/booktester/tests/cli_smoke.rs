use assert_cmd::cargo::cargo_bin_cmd;

fn fixture(path: &str) -> String {
    format!("{}/tests/fixtures/{path}", env!("CARGO_MANIFEST_DIR"))
}

#[test]
fn help_lists_directive_flags() {
    let mut cmd = cargo_bin_cmd!("booktester");
    cmd.arg("--help");
    let out = cmd.assert().success();
    let stdout = String::from_utf8(out.get_output().stdout.clone()).expect("utf8");

    assert!(stdout.contains("--chapter"));
    assert!(stdout.contains("--skip-line"));
    assert!(stdout.contains("--fast-forward"));
    assert!(stdout.contains("--trust-fast-forward"));
}

#[test]
fn list_prints_one_row_per_listing() {
    let mut cmd = cargo_bin_cmd!("booktester");
    cmd.arg("--chapter")
        .arg("2")
        .arg("--config")
        .arg(fixture("configs/book.toml"))
        .arg("--list");
    let out = cmd.assert().success();
    let stdout = String::from_utf8(out.get_output().stdout.clone()).expect("utf8");

    assert_eq!(stdout.lines().count(), 7);
    assert!(stdout.contains("lists/views.py  (ch02l002)"));
    assert!(stdout.contains("[skipme]"));
}

#[test]
fn list_accepts_an_explicit_chapter_file() {
    let mut cmd = cargo_bin_cmd!("booktester");
    cmd.arg("--chapter")
        .arg("2")
        .arg("--chapter-file")
        .arg(fixture("chapters/chapter_02.asciidoc"))
        .arg("--list");
    cmd.assert().success();
}

#[test]
fn missing_config_exits_nonzero() {
    let mut cmd = cargo_bin_cmd!("booktester");
    cmd.arg("--chapter")
        .arg("2")
        .arg("--config")
        .arg(fixture("configs/missing.toml"))
        .arg("--list");
    cmd.assert().failure();
}

#[test]
fn malformed_skip_directive_exits_nonzero() {
    let mut cmd = cargo_bin_cmd!("booktester");
    cmd.arg("--chapter")
        .arg("2")
        .arg("--chapter-file")
        .arg(fixture("chapters/chapter_02.asciidoc"))
        .arg("--skip")
        .arg("runserver")
        .arg("--list");
    let out = cmd.assert().failure();
    let stderr = String::from_utf8(out.get_output().stderr.clone()).expect("utf8");
    assert!(stderr.contains("NUMBER:TEXT"));
}
