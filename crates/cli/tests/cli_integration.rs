// DLPatch - Preloader Download Handler Patcher
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::{tempdir, TempDir};

const BASE: u32 = 0x0200_7500;

// Halfword offsets of the planted code.
const HANDLER: usize = 0x40;
const STORE: usize = HANDLER + 0x10;
const JUMP_DA: usize = 0x100;
const SEC_REGION: usize = 0x180;

#[allow(deprecated)]
fn dlpatch() -> Command {
    Command::cargo_bin("dlpatch").unwrap()
}

fn image(with_stages: bool) -> Vec<u16> {
    let mut words = vec![0x3111u16; 0x200];
    words[HANDLER..HANDLER + 3].copy_from_slice(&[0xE92D, 0x4EF0, 0x460E]);
    if with_stages {
        words[STORE] = 0x9302; // str r3, [sp, #8]
        words[STORE + 5] = 0x4603;
        words[JUMP_DA..JUMP_DA + 2].copy_from_slice(&[0x2600, 0x4630]);
        words[JUMP_DA + 20] = 0x4B08; // ldr r3, [pc, #0x20]
        words[SEC_REGION..SEC_REGION + 3].copy_from_slice(&[0xB537, 0x4604, 0x460D]);
    }
    words
}

fn write_image(dir: &TempDir, words: &[u16]) -> PathBuf {
    let path = dir.path().join("preloader.bin");
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    fs::write(&path, bytes).unwrap();
    path
}

fn halfword(bytes: &[u8], word: usize) -> u16 {
    u16::from_le_bytes([bytes[word * 2], bytes[word * 2 + 1]])
}

fn run_json(image: &Path, extra: &[&str]) -> (Option<i32>, Value) {
    let output = dlpatch()
        .arg("run")
        .arg("--image")
        .arg(image)
        .arg("--json")
        .args(extra)
        .output()
        .unwrap();
    let json = serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
        panic!(
            "stdout is not JSON ({}): {}\nstderr: {}",
            e,
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        )
    });
    (output.status.code(), json)
}

#[test]
fn test_entry_only_image_hands_off() {
    let dir = tempdir().unwrap();
    let path = write_image(&dir, &image(false));

    dlpatch()
        .arg("run")
        .arg("--image")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains(format!(
            "usbdl_handler found at {:#x}",
            BASE + HANDLER as u32 * 2
        )))
        .stdout(predicate::str::contains("send_da is NOT patched"))
        .stdout(predicate::str::contains("jump_da is NOT patched"))
        .stdout(predicate::str::contains("sec_region_check is NOT patched"))
        .stdout(predicate::str::ends_with("Jumping back to usbdl_handler...\n"));
}

#[test]
fn test_json_summary() {
    let dir = tempdir().unwrap();
    let path = write_image(&dir, &image(true));

    let (code, json) = run_json(&path, &["--boot-arg", "0x3"]);
    assert_eq!(code, Some(0));
    assert_eq!(json["result_schema_version"], "1.0");
    assert_eq!(json["status"], "handoff");

    let entry = (BASE + HANDLER as u32 * 2) as u64;
    assert_eq!(json["handoff"]["entry"], entry);
    assert_eq!(json["handoff"]["target"], entry | 1);
    assert_eq!(json["handoff"]["arg0"], 3);
    assert_eq!(json["handoff"]["arg1"], 300);

    let stages = json["report"]["stages"].as_array().unwrap();
    let names: Vec<_> = stages.iter().map(|s| s["stage"].as_str().unwrap()).collect();
    assert_eq!(names, ["send_da", "jump_da", "sec_region_check"]);
    assert!(stages.iter().all(|s| s["patched"] == true));
    assert_eq!(
        stages[0]["patches"][0]["addr"],
        (BASE + STORE as u32 * 2) as u64
    );
}

#[test]
fn test_missing_handler_halts() {
    let dir = tempdir().unwrap();
    let path = write_image(&dir, &[0x3111u16; 0x200]);

    dlpatch()
        .arg("run")
        .arg("--image")
        .arg(&path)
        .assert()
        .code(3)
        .stdout(predicate::str::contains("usbdl_handler not found :("))
        .stdout(predicate::str::contains("Jumping back").not());

    let (code, json) = run_json(&path, &[]);
    assert_eq!(code, Some(3));
    assert_eq!(json["status"], "halted");
    assert!(json.get("handoff").is_none());
    assert_eq!(json["error"], "usbdl_handler signature not found");
}

#[test]
fn test_output_holds_patched_image() {
    let dir = tempdir().unwrap();
    let path = write_image(&dir, &image(true));
    let out = dir.path().join("patched.bin");

    dlpatch()
        .arg("run")
        .arg("--image")
        .arg(&path)
        .arg("--output")
        .arg(&out)
        .assert()
        .success();

    let patched = fs::read(&out).unwrap();
    assert_eq!(patched.len(), 0x400);
    assert_eq!(halfword(&patched, STORE), 0x9B02);
    assert_eq!(halfword(&patched, JUMP_DA + 21), 0xBF00);
    assert_eq!(halfword(&patched, SEC_REGION), 0x2000);
    assert_eq!(halfword(&patched, SEC_REGION + 1), 0x4770);
    // Untouched code stays as it was.
    assert_eq!(halfword(&patched, HANDLER), 0xE92D);
}

#[test]
fn test_custom_base_and_profile() {
    let dir = tempdir().unwrap();
    let path = write_image(&dir, &image(false));
    let profile = dir.path().join("profile.yaml");
    fs::write(
        &profile,
        "name: \"test\"\ncode:\n  base: 0x100000\n  size: \"64KiB\"\nhandler_arg: 7\n",
    )
    .unwrap();

    let (code, json) = run_json(&path, &["--platform", profile.to_str().unwrap()]);
    assert_eq!(code, Some(0));
    assert_eq!(json["handoff"]["entry"], 0x10_0000 + HANDLER as u64 * 2);
    assert_eq!(json["handoff"]["arg1"], 7);
    // Scanning is clipped to the dump.
    assert_eq!(json["platform"]["code_end"], 0x10_0400);

    let (code, json) = run_json(&path, &["--base", "0x40000000"]);
    assert_eq!(code, Some(0));
    assert_eq!(json["handoff"]["entry"], 0x4000_0000 + HANDLER as u64 * 2);
}

#[test]
fn test_config_errors_exit_2() {
    let dir = tempdir().unwrap();

    dlpatch()
        .args(["run", "--image"])
        .arg(dir.path().join("missing.bin"))
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Failed to read image"));

    let odd = dir.path().join("odd.bin");
    fs::write(&odd, [0u8; 3]).unwrap();
    dlpatch()
        .args(["run", "--image"])
        .arg(&odd)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("odd length"));

    let path = write_image(&dir, &image(false));
    let profile = dir.path().join("bad.yaml");
    fs::write(&profile, "name: \"bad\"\ncode: { base: 0x1000, size: \"0\" }\n").unwrap();
    dlpatch()
        .args(["run", "--image"])
        .arg(&path)
        .arg("--platform")
        .arg(&profile)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Code region is empty"));
}
