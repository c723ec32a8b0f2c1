mod test_support;

use schoold::api::{Body, Request};
use schoold::roster;
use serde_json::json;
use test_support::{
    admin_token, call, create_student, national_code, open_state, otp_login, request_err,
    request_ok, student_body, student_phone,
};

#[test]
fn registration_requires_every_mandatory_field() {
    let mut state = open_state("schoold-student-required");
    let admin = admin_token(&mut state);

    let mut body = student_body(1);
    body.as_object_mut().expect("object").remove("father_name");
    let resp = call(&mut state, Request::post("/api/student", body).with_bearer(&admin));
    assert_eq!(resp.status, 400);
    assert_eq!(resp.json()["details"]["missing"], json!(["father_name"]));

    let mut body = student_body(1);
    body["student_phone"] = json!("9123");
    let (status, _) = request_err(&mut state, Request::post("/api/student", body).with_bearer(&admin));
    assert_eq!(status, 400);

    let mut body = student_body(1);
    body["residence_status"] = json!("castle");
    let (status, _) = request_err(&mut state, Request::post("/api/student", body).with_bearer(&admin));
    assert_eq!(status, 400);
}

#[test]
fn create_read_edit_delete() {
    let mut state = open_state("schoold-student-crud");
    let admin = admin_token(&mut state);

    let mut body = student_body(1);
    body["residence_status"] = json!("مستاجر");
    body["guardian"] = json!({ "name": "Hassan", "relation": "uncle", "phone": "09130000009" });
    let id = create_student(&mut state, &admin, body);

    let fetched = request_ok(&mut state, Request::get(format!("/api/student/{id}")).with_bearer(&admin));
    assert_eq!(fetched["residence_status"], "tenant");
    assert_eq!(fetched["guardian"]["relation"], "uncle");
    assert_eq!(fetched["appearance_neat"], false);
    assert_eq!(fetched["commitment"], json!({ "discipline": false, "rules": false }));
    assert!(fetched["accepted"].is_null());

    let (status, _) = request_err(
        &mut state,
        Request::post("/api/student", student_body(1)).with_bearer(&admin),
    );
    assert_eq!(status, 400, "duplicate national code");

    let edited = request_ok(
        &mut state,
        Request::put(format!("/api/student/{id}"), json!({ "grade": 17.25, "polite_behavior": true }))
            .with_bearer(&admin),
    );
    assert_eq!(edited["student"]["grade"], 17.25);
    assert_eq!(edited["student"]["polite_behavior"], true);
    assert_eq!(edited["student"]["first_name"], "Student1");

    let by_code = request_ok(
        &mut state,
        Request::get(format!("/api/student/national-code/{}", national_code(1))).with_bearer(&admin),
    );
    assert_eq!(by_code["id"], id);

    request_ok(&mut state, Request::delete(format!("/api/student/{id}")).with_bearer(&admin));
    let (status, _) = request_err(&mut state, Request::get(format!("/api/student/{id}")).with_bearer(&admin));
    assert_eq!(status, 404);
}

#[test]
fn portrait_upload_is_stored_and_replaced() {
    let mut state = open_state("schoold-student-portrait");
    let admin = admin_token(&mut state);

    let (status, _) = request_err(
        &mut state,
        Request::post("/api/student", student_body(2))
            .with_file("portrait", "face.gif", vec![1, 2, 3])
            .with_bearer(&admin),
    );
    assert_eq!(status, 400);

    let created = request_ok(
        &mut state,
        Request::post("/api/student", student_body(2))
            .with_file("portrait", "face.png", vec![0x89, b'P', b'N', b'G'])
            .with_bearer(&admin),
    );
    let url = created["student"]["student_portrait_front"]["url"]
        .as_str()
        .expect("portrait url")
        .to_string();
    assert!(url.starts_with("/uploads/students/"));
    let on_disk = state
        .uploads_dir()
        .join(url.trim_start_matches("/uploads/"));
    assert!(on_disk.exists());

    let id = created["student"]["id"].as_str().expect("id").to_string();
    request_ok(
        &mut state,
        Request::put(format!("/api/student/{id}"), json!({}))
            .with_file("portrait", "new.jpg", vec![0xff, 0xd8])
            .with_bearer(&admin),
    );
    assert!(!on_disk.exists(), "old portrait removed after replacement");
}

#[test]
fn listing_pages_and_searches() {
    let mut state = open_state("schoold-student-list");
    let admin = admin_token(&mut state);
    for n in 1..=3 {
        create_student(&mut state, &admin, student_body(n));
    }

    let page = request_ok(
        &mut state,
        Request::get("/api/student")
            .with_query("page", "1")
            .with_query("limit", "2")
            .with_bearer(&admin),
    );
    assert_eq!(page["total"], 3);
    assert_eq!(page["totalPages"], 2);
    assert_eq!(page["students"].as_array().map(Vec::len), Some(2));
    // Newest first.
    assert_eq!(page["students"][0]["first_name"], "Student3");

    let found = request_ok(
        &mut state,
        Request::get("/api/student").with_query("search", "Student2").with_bearer(&admin),
    );
    assert_eq!(found["total"], 1);
    assert_eq!(found["students"][0]["national_code"], national_code(2));

    let none = request_ok(
        &mut state,
        Request::get("/api/student").with_query("search", "%").with_bearer(&admin),
    );
    assert_eq!(none["total"], 0);

    let past_end = request_ok(
        &mut state,
        Request::get("/api/student")
            .with_query("page", i64::MAX.to_string())
            .with_query("limit", "500")
            .with_bearer(&admin),
    );
    assert_eq!(past_end["total"], 3);
    assert_eq!(past_end["students"].as_array().map(Vec::len), Some(0));
}

#[test]
fn students_log_in_with_their_own_phone() {
    let mut state = open_state("schoold-student-login");
    let admin = admin_token(&mut state);
    let id = create_student(&mut state, &admin, student_body(5));

    let login = otp_login(&mut state, "student", "student_phone", &student_phone(5));
    assert_eq!(login["student"]["id"], id);
    let token = login["token"].as_str().expect("token").to_string();

    let me = request_ok(&mut state, Request::get("/api/student/me").with_bearer(&token));
    assert_eq!(me["national_code"], national_code(5));

    // A student token is not a staff token.
    let (status, _) = request_err(&mut state, Request::get("/api/student").with_bearer(&token));
    assert_eq!(status, 403);
}

#[test]
fn roster_import_skips_bad_rows_and_export_reads_back() {
    let mut state = open_state("schoold-student-roster");
    let admin = admin_token(&mut state);
    create_student(&mut state, &admin, student_body(1));

    let template = student_body(2);
    let keys: Vec<&String> = template.as_object().expect("object").keys().collect();
    let mut writer = csv::Writer::from_writer(Vec::new());
    let headers: Vec<&str> = keys
        .iter()
        .map(|k| {
            roster::COLUMNS
                .iter()
                .find(|(key, _)| *key == k.as_str())
                .map_or(k.as_str(), |(_, fa)| *fa)
        })
        .collect();
    writer.write_record(&headers).expect("header");
    // The second data row collides with the existing national code.
    for n in [2, 1] {
        let body = student_body(n);
        let cells: Vec<&str> = keys.iter().map(|k| body[k.as_str()].as_str().unwrap_or_default()).collect();
        writer.write_record(&cells).expect("row");
    }
    let csv = writer.into_inner().expect("csv bytes");

    let imported = request_ok(
        &mut state,
        Request::post("/api/student/import", json!({}))
            .with_file("file", "roster.csv", csv)
            .with_bearer(&admin),
    );
    assert_eq!(imported["added"], 1);
    assert_eq!(imported["skipped"], 1);
    assert_eq!(imported["skippedRows"][0]["row"], 3);

    let (status, _) = request_err(
        &mut state,
        Request::post("/api/student/import", json!({}))
            .with_file("file", "roster.txt", b"nope".to_vec())
            .with_bearer(&admin),
    );
    assert_eq!(status, 400);

    let resp = call(&mut state, Request::get("/api/student/export").with_bearer(&admin));
    assert_eq!(resp.status, 200);
    let Body::File { file_name, bytes, .. } = resp.body else {
        panic!("export must be a file");
    };
    assert_eq!(file_name, "students.xlsx");
    let rows = roster::read_roster(&file_name, &bytes).expect("read export");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].values["national_code"], national_code(1));
    assert_eq!(rows[1].values["first_name"], "Student2");
}
