mod test_support;

use schoold::api::Request;
use serde_json::json;
use test_support::{
    admin_token, create_class, create_student, national_code, open_state, request_err, request_ok,
    student_body, teacher_with_token,
};

#[test]
fn distribution_balances_unassigned_students_by_grade() {
    let mut state = open_state("schoold-class-distribute");
    let admin = admin_token(&mut state);
    create_class(&mut state, &admin, "10-A", "10");
    create_class(&mut state, &admin, "10-B", "10");
    for (n, grade) in [(1, json!(19.5)), (2, json!(18)), (3, json!(null))] {
        let mut body = student_body(n);
        body["grade"] = grade;
        create_student(&mut state, &admin, body);
    }

    let waiting = request_ok(
        &mut state,
        Request::get("/api/class/unassigned-students/10").with_bearer(&admin),
    );
    let order: Vec<_> = waiting
        .as_array()
        .expect("list")
        .iter()
        .map(|s| s["national_code"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(order, vec![national_code(1), national_code(2), national_code(3)]);

    let result = request_ok(
        &mut state,
        Request::post("/api/class/distribute-students/10", json!({})).with_bearer(&admin),
    );
    assert_eq!(result["assigned"], 3);
    assert_eq!(result["classSizes"], json!({ "10-A": 2, "10-B": 1 }));

    let (status, _) = request_err(
        &mut state,
        Request::post("/api/class/distribute-students/10", json!({})).with_bearer(&admin),
    );
    assert_eq!(status, 404);

    let classes = request_ok(&mut state, Request::get("/api/class/level/10").with_bearer(&admin));
    let a = &classes[0];
    assert_eq!(a["name"], "10-A");
    assert_eq!(a["students"].as_array().map(Vec::len), Some(2));
}

#[test]
fn class_names_are_unique_and_levels_validated() {
    let mut state = open_state("schoold-class-add");
    let admin = admin_token(&mut state);
    create_class(&mut state, &admin, "11-A", "11");

    let (status, _) = request_err(
        &mut state,
        Request::post("/api/class/add", json!({ "name": "11-A", "level": "11" })).with_bearer(&admin),
    );
    assert_eq!(status, 400);
    let (status, _) = request_err(
        &mut state,
        Request::post("/api/class/add", json!({ "name": "11-B" })).with_bearer(&admin),
    );
    assert_eq!(status, 400);

    let found = request_ok(&mut state, Request::get("/api/class/name/11-A").with_bearer(&admin));
    assert_eq!(found["level"], "11");
}

#[test]
fn timetable_assignment_and_period_removal() {
    let mut state = open_state("schoold-class-timetable");
    let admin = admin_token(&mut state);
    let (math_id, math_token) = teacher_with_token(&mut state, &admin, 1);
    let (art_id, _) = teacher_with_token(&mut state, &admin, 2);
    let class_id = create_class(&mut state, &admin, "12-A", "12");

    for (subject, teacher) in [("Math", &math_id), ("Art", &art_id)] {
        request_ok(
            &mut state,
            Request::post(
                "/api/class/assign-teacher",
                json!({ "classId": class_id, "subject": subject, "teacherId": teacher, "day": "Monday" }),
            )
            .with_bearer(&admin),
        );
    }
    let (status, _) = request_err(
        &mut state,
        Request::post(
            "/api/class/assign-teacher",
            json!({ "classId": class_id, "subject": "X", "teacherId": "ghost", "day": "monday" }),
        )
        .with_bearer(&admin),
    );
    assert_eq!(status, 404);

    let mine = request_ok(&mut state, Request::get("/api/class/teacher/me/classes").with_bearer(&math_token));
    assert_eq!(mine.as_array().map(Vec::len), Some(1));

    let (status, code) = request_err(
        &mut state,
        Request::delete(format!("/api/teacher/{math_id}")).with_bearer(&admin),
    );
    assert_eq!((status, code.as_str()), (409, "conflict"));

    let removed = request_ok(
        &mut state,
        Request::post(
            "/api/class/remove-period",
            json!({ "classId": class_id, "day": "monday", "period": 1 }),
        )
        .with_bearer(&admin),
    );
    let monday = &removed["cls"]["days"]["monday"];
    assert_eq!(monday.as_array().map(Vec::len), Some(1));
    assert_eq!(monday[0]["period"], 1);
    assert_eq!(monday[0]["subject"], "Art");

    request_ok(&mut state, Request::delete(format!("/api/teacher/{math_id}")).with_bearer(&admin));
    let (status, _) = request_err(&mut state, Request::get("/api/teacher/me").with_bearer(&math_token));
    assert_eq!(status, 401);
}

#[test]
fn membership_changes_and_class_deletion() {
    let mut state = open_state("schoold-class-membership");
    let admin = admin_token(&mut state);
    let class_id = create_class(&mut state, &admin, "10-C", "10");
    let student_id = create_student(&mut state, &admin, student_body(7));

    let (status, _) = request_err(
        &mut state,
        Request::post(
            "/api/class/add-students",
            json!({ "classId": class_id, "nationalCodes": ["9999999999"] }),
        )
        .with_bearer(&admin),
    );
    assert_eq!(status, 404);

    request_ok(
        &mut state,
        Request::post(
            "/api/class/add-students",
            json!({ "classId": class_id, "nationalCodes": [national_code(7)] }),
        )
        .with_bearer(&admin),
    );
    let members = request_ok(
        &mut state,
        Request::get(format!("/api/class/{class_id}/students")).with_bearer(&admin),
    );
    assert_eq!(members[0]["id"], student_id);

    request_ok(&mut state, Request::delete(format!("/api/class/{class_id}")).with_bearer(&admin));
    let student = request_ok(
        &mut state,
        Request::get(format!("/api/student/{student_id}")).with_bearer(&admin),
    );
    assert!(student["class"].is_null());
}

#[test]
fn teacher_warnings_are_counted() {
    let mut state = open_state("schoold-class-teacher-reports");
    let admin = admin_token(&mut state);
    let (teacher_id, token) = teacher_with_token(&mut state, &admin, 3);

    let filed = request_ok(
        &mut state,
        Request::post(
            "/api/teacher/reports",
            json!({ "teacherId": teacher_id, "date": "1403/07/20", "message": "Late to class" }),
        )
        .with_bearer(&admin),
    );
    assert_eq!(filed["amount"], 1);

    let own = request_ok(
        &mut state,
        Request::get(format!("/api/teacher/reports/{teacher_id}")).with_bearer(&token),
    );
    assert_eq!(own["reports"][0]["message"], "Late to class");

    let teacher = request_ok(
        &mut state,
        Request::get(format!("/api/teacher/{teacher_id}")).with_bearer(&admin),
    );
    assert_eq!(teacher["data"]["numberOfReports"], 1);
}
