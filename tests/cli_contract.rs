use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::Value;
use tempfile::tempdir;

fn write_png(path: &Path, width: u32, height: u32, rgb: [u8; 3]) {
    let image = image::RgbImage::from_pixel(width, height, image::Rgb(rgb));
    image.save(path).expect("png should write");
}

fn run_deck(cwd: &Path, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_ascii-deck"))
        .current_dir(cwd)
        .env("RUST_LOG", "ascii_deck=warn")
        .args(args)
        .output()
        .expect("ascii-deck command should run")
}

fn command_available(name: &str, version_arg: &str) -> bool {
    Command::new(name)
        .arg(version_arg)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

fn white_picture(dir: &Path) -> PathBuf {
    let path = dir.join("white.png");
    write_png(&path, 320, 180, [255, 255, 255]);
    path
}

#[test]
fn text_of_a_white_picture_is_all_densest_glyphs() {
    let dir = tempdir().expect("tempdir should create");
    white_picture(dir.path());

    let output = run_deck(
        dir.path(),
        &["text", "white.png", "--width", "80", "--contrast", "0"],
    );
    assert!(
        output.status.success(),
        "text should succeed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8(output.stdout).expect("utf8 output");
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 22);
    assert!(lines.iter().all(|line| *line == "$".repeat(80)));
}

#[test]
fn negative_contrast_values_parse() {
    let dir = tempdir().expect("tempdir should create");
    white_picture(dir.path());
    let output = run_deck(
        dir.path(),
        &["text", "white.png", "--width", "40", "--contrast", "-0.3", "--invert"],
    );
    assert!(output.status.success(), "negative contrast should parse");
    let stdout = String::from_utf8(output.stdout).expect("utf8 output");
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 11);
    let first = lines[0].chars().next().expect("glyph");
    assert_ne!(first, '$');
    assert!(lines
        .iter()
        .all(|line| line.chars().count() == 40 && line.chars().all(|c| c == first)));
}

#[test]
fn snapshot_writes_a_png_sized_by_the_grid() {
    let dir = tempdir().expect("tempdir should create");
    white_picture(dir.path());

    let output = run_deck(
        dir.path(),
        &["snapshot", "white.png", "--width", "80", "-o", "out/frame.png"],
    );
    assert!(
        output.status.success(),
        "snapshot should succeed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let snapshot = image::open(dir.path().join("out/frame.png")).expect("snapshot should decode");
    // Default cell scale 2: 12x20 pixel cells.
    assert_eq!((snapshot.width(), snapshot.height()), (80 * 12, 22 * 20));
}

#[test]
fn probe_json_reports_source_dimensions() {
    let dir = tempdir().expect("tempdir should create");
    write_png(&dir.path().join("small.png"), 64, 32, [10, 20, 30]);

    let first = run_deck(dir.path(), &["probe", "small.png", "--json"]);
    assert!(first.status.success(), "probe --json should succeed");
    let second = run_deck(dir.path(), &["probe", "small.png", "--json"]);
    assert_eq!(first.stdout, second.stdout, "json output should be stable");

    let parsed: Value = serde_json::from_slice(&first.stdout).expect("json should parse");
    assert_eq!(parsed["width"], 64);
    assert_eq!(parsed["height"], 32);
}

#[test]
fn out_of_range_width_is_rejected() {
    let dir = tempdir().expect("tempdir should create");
    white_picture(dir.path());

    let output = run_deck(dir.path(), &["text", "white.png", "--width", "500"]);
    assert!(!output.status.success(), "width 500 should be rejected");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("width must be in [40, 200]"), "stderr: {stderr}");
}

#[test]
fn preset_file_supplies_defaults_and_flags_override_it() {
    let dir = tempdir().expect("tempdir should create");
    white_picture(dir.path());
    fs::write(
        dir.path().join("deck.yaml"),
        "width: 50\ncontrast: 0.0\nramp: short\n",
    )
    .expect("config should write");

    let from_file = run_deck(dir.path(), &["--config", "deck.yaml", "text", "white.png"]);
    assert!(from_file.status.success(), "config text should succeed");
    let stdout = String::from_utf8(from_file.stdout).expect("utf8 output");
    assert!(stdout.lines().all(|line| line == "@".repeat(50)));

    let overridden = run_deck(
        dir.path(),
        &["--config", "deck.yaml", "text", "white.png", "--width", "60"],
    );
    assert!(overridden.status.success(), "override should succeed");
    let stdout = String::from_utf8(overridden.stdout).expect("utf8 output");
    assert!(stdout.lines().all(|line| line == "@".repeat(60)));
}

#[test]
fn unknown_preset_keys_are_rejected() {
    let dir = tempdir().expect("tempdir should create");
    white_picture(dir.path());
    fs::write(dir.path().join("deck.yaml"), "width: 50\nsharpness: 3\n").expect("config should write");

    let output = run_deck(dir.path(), &["--config", "deck.yaml", "text", "white.png"]);
    assert!(!output.status.success(), "unknown key should fail");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed to load config"), "stderr: {stderr}");
}

#[test]
fn playing_a_still_picture_ends_on_its_own() {
    let dir = tempdir().expect("tempdir should create");
    white_picture(dir.path());

    let output = run_deck(
        dir.path(),
        &["play", "white.png", "--no-preview", "--still-duration", "0.3"],
    );
    assert!(
        output.status.success(),
        "play should finish: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn export_of_a_still_picture_produces_a_video() {
    if !command_available("ffmpeg", "-version") {
        eprintln!("skipping export contract test: ffmpeg is not installed");
        return;
    }
    let dir = tempdir().expect("tempdir should create");
    white_picture(dir.path());

    let output = run_deck(
        dir.path(),
        &[
            "export",
            "white.png",
            "--still-duration",
            "1",
            "--fps",
            "5",
            "--width",
            "40",
            "-o",
            "clip.video",
        ],
    );
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("no supported capture format") {
        eprintln!("skipping export contract test: no usable encoder");
        return;
    }
    assert!(output.status.success(), "export should succeed: {stderr}");
    let bytes = fs::read(dir.path().join("clip.video")).expect("export should exist");
    assert!(!bytes.is_empty());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("5 frames"), "stdout: {stdout}");
}

#[test]
fn no_invert_and_no_color_switch_off_preset_values() {
    let dir = tempdir().expect("tempdir should create");
    white_picture(dir.path());
    fs::write(
        dir.path().join("deck.yaml"),
        "width: 40\ncontrast: 0.0\ninverted: true\ncolor: true\nramp: short\n",
    )
    .expect("config should write");

    let from_file = run_deck(dir.path(), &["--config", "deck.yaml", "text", "white.png"]);
    assert!(from_file.status.success(), "config text should succeed");
    let stdout = String::from_utf8(from_file.stdout).expect("utf8 output");
    assert!(stdout.lines().all(|line| line == " ".repeat(40)), "stdout: {stdout:?}");

    let switched = run_deck(
        dir.path(),
        &["--config", "deck.yaml", "text", "white.png", "--no-invert", "--no-color"],
    );
    assert!(switched.status.success(), "--no-invert should succeed");
    let stdout = String::from_utf8(switched.stdout).expect("utf8 output");
    assert!(stdout.lines().all(|line| line == "@".repeat(40)), "stdout: {stdout:?}");

    let last_wins = run_deck(
        dir.path(),
        &["text", "white.png", "--width", "40", "--contrast", "0", "--ramp", "short", "--no-invert", "--invert"],
    );
    assert!(last_wins.status.success(), "repeated switches should parse");
    let stdout = String::from_utf8(last_wins.stdout).expect("utf8 output");
    assert!(stdout.lines().all(|line| line == " ".repeat(40)), "stdout: {stdout:?}");
}
