#![allow(dead_code)]

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use schoold::api::{self, AppState, Request, Response};
use schoold::config::Config;
use serde_json::{json, Value};

pub const ADMIN_MOBILE: &str = "09120000000";

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub fn open_state(prefix: &str) -> AppState {
    let state = AppState::open(Config::with_data_dir(temp_dir(prefix))).expect("open state");
    api::seed_admin(&state.db, ADMIN_MOBILE, "Admin").expect("seed admin");
    state
}

pub fn call(state: &mut AppState, req: Request) -> Response {
    api::handle_request(state, req)
}

/// Sends the request and insists on a 2xx, returning the JSON body.
pub fn request_ok(state: &mut AppState, req: Request) -> Value {
    let label = format!("{:?} {}", req.method, req.path);
    let resp = call(state, req);
    assert!(
        (200..300).contains(&resp.status),
        "{label} failed with {}: {}",
        resp.status,
        resp.json()
    );
    resp.json().clone()
}

/// Sends the request and returns `(status, code)` of the error body.
pub fn request_err(state: &mut AppState, req: Request) -> (u16, String) {
    let resp = call(state, req);
    assert!(resp.status >= 400, "expected failure, got {}: {}", resp.status, resp.json());
    let code = resp.json()["code"].as_str().unwrap_or_default().to_string();
    (resp.status, code)
}

fn stored_otp(state: &AppState, table: &str, column: &str, ident: &str) -> String {
    state
        .db
        .query_row(
            &format!("SELECT otp FROM {table} WHERE {column} = ?"),
            [ident],
            |r| r.get(0),
        )
        .expect("otp issued")
}

/// Full OTP round trip for one account family; returns the login body.
pub fn otp_login(state: &mut AppState, family: &str, ident_key: &str, ident: &str) -> Value {
    let (table, column) = match family {
        "user" => ("users", "mobile"),
        "teacher" => ("teachers", "mobile"),
        "student" => ("students", "student_phone"),
        other => panic!("unknown account family {other}"),
    };
    request_ok(
        state,
        Request::post(format!("/api/{family}/send-otp"), json!({ ident_key: ident })),
    );
    let otp = stored_otp(state, table, column, ident);
    request_ok(
        state,
        Request::post(format!("/api/{family}/login"), json!({ ident_key: ident, "otp": otp })),
    )
}

pub fn admin_token(state: &mut AppState) -> String {
    let login = otp_login(state, "user", "mobile", ADMIN_MOBILE);
    login["token"].as_str().expect("token").to_string()
}

pub fn staff_token(state: &mut AppState, admin: &str, username: &str, mobile: &str, perms: &[&str]) -> String {
    request_ok(
        state,
        Request::post(
            "/api/user",
            json!({
                "username": username,
                "mobile": mobile,
                "role": "staff",
                "name": username,
                "permissions": perms,
            }),
        )
        .with_bearer(admin),
    );
    let login = otp_login(state, "user", "mobile", mobile);
    login["token"].as_str().expect("token").to_string()
}

/// Registers a teacher and logs them in. Returns `(teacher_id, token)`.
pub fn teacher_with_token(state: &mut AppState, admin: &str, n: u32) -> (String, String) {
    let mobile = format!("0935{n:07}");
    let created = request_ok(
        state,
        Request::post(
            "/api/teacher",
            json!({
                "mobile": mobile,
                "first_name": format!("Teacher{n}"),
                "last_name": "Karimi",
                "birth_date": "1360/01/01",
                "birth_certificate_number": format!("{n}"),
                "national_code": format!("11111{n:05}"),
                "academic_year": "1403",
                "academic_level": "bachelor_degree",
            }),
        )
        .with_bearer(admin),
    );
    let id = created["data"]["id"].as_str().expect("teacher id").to_string();
    let login = otp_login(state, "teacher", "mobile", &mobile);
    (id, login["token"].as_str().expect("token").to_string())
}

pub fn student_phone(n: u32) -> String {
    format!("0912{n:07}")
}

pub fn national_code(n: u32) -> String {
    format!("00000{n:05}")
}

/// A complete, valid registration form for student `n`.
pub fn student_body(n: u32) -> Value {
    json!({
        "first_name": format!("Student{n}"),
        "last_name": "Ahmadi",
        "father_name": "Reza",
        "mother_name": "Maryam",
        "national_code": national_code(n),
        "birth_date": "1388/05/12",
        "birth_certificate_number": format!("{n}"),
        "student_phone": student_phone(n),
        "father_phone": "09130000001",
        "father_job": "Engineer",
        "mother_phone": "09130000002",
        "academic_year": "1403",
        "education_level": "10",
        "mother_job": "Teacher",
        "emergency_phone": "09130000003",
        "marital_status": "married",
        "previous_school_address": "Tehran",
        "home_address": "Tehran, Valiasr St.",
        "residence_status": "owner",
        "postal_code": "1234567890",
        "home_phone": format!("021{n:05}"),
        "student_goal": "Medicine",
        "academic_status": "high",
    })
}

pub fn create_student(state: &mut AppState, admin: &str, body: Value) -> String {
    let created = request_ok(state, Request::post("/api/student", body).with_bearer(admin));
    created["student"]["id"].as_str().expect("student id").to_string()
}

pub fn create_class(state: &mut AppState, admin: &str, name: &str, level: &str) -> String {
    let created = request_ok(
        state,
        Request::post("/api/class/add", json!({ "name": name, "level": level })).with_bearer(admin),
    );
    created["class"]["id"].as_str().expect("class id").to_string()
}
