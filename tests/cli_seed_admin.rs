mod test_support;

use std::process::Command;

use schoold::api::{self, AppState, Request};
use schoold::config::Config;
use serde_json::json;
use test_support::temp_dir;

fn seed(data_dir: &std::path::Path, mobile: &str) -> (bool, String) {
    let out = Command::new(env!("CARGO_BIN_EXE_schoold"))
        .args(["seed-admin", "--mobile", mobile, "--data-dir"])
        .arg(data_dir)
        .output()
        .expect("run schoold");
    (out.status.success(), String::from_utf8_lossy(&out.stdout).to_string())
}

#[test]
fn seed_admin_is_idempotent_and_usable() {
    let data_dir = temp_dir("schoold-cli-seed");

    let (ok, stdout) = seed(&data_dir, "09124444444");
    assert!(ok, "first seed failed: {stdout}");
    assert!(stdout.contains("created administrator"));

    let (ok, stdout) = seed(&data_dir, "09124444444");
    assert!(ok);
    assert!(stdout.contains("already exists"));

    let mut state = AppState::open(Config::with_data_dir(&data_dir)).expect("open state");
    let resp = api::handle_request(
        &mut state,
        Request::post("/api/user/send-otp", json!({ "mobile": "09124444444" })),
    );
    assert_eq!(resp.status, 200);
}

#[test]
fn seed_admin_rejects_malformed_mobile() {
    let data_dir = temp_dir("schoold-cli-seed-bad");
    let (ok, _) = seed(&data_dir, "12345");
    assert!(!ok);
}
