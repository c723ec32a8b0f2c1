mod test_support;

use schoold::api::{AppState, Request};
use serde_json::{json, Value};
use test_support::{
    admin_token, create_class, create_student, national_code, open_state, otp_login, request_err,
    request_ok, staff_token, student_body, student_phone, teacher_with_token,
};

// 2026-10-17 is a Saturday.
const DATE: &str = "2026-10-17";

struct School {
    admin: String,
    class_id: String,
    teacher: String,
    students: Vec<String>,
}

fn school(state: &mut AppState) -> School {
    let admin = admin_token(state);
    let (teacher_id, teacher) = teacher_with_token(state, &admin, 1);
    let class_id = create_class(state, &admin, "10-A", "10");
    let students = vec![
        create_student(state, &admin, student_body(1)),
        create_student(state, &admin, student_body(2)),
    ];
    request_ok(
        state,
        Request::post(
            "/api/class/add-students",
            json!({ "classId": class_id, "nationalCodes": [national_code(1), national_code(2)] }),
        )
        .with_bearer(&admin),
    );
    request_ok(
        state,
        Request::post(
            "/api/class/assign-teacher",
            json!({ "classId": class_id, "subject": "Math", "teacherId": teacher_id, "day": "saturday" }),
        )
        .with_bearer(&admin),
    );
    School {
        admin,
        class_id,
        teacher,
        students,
    }
}

fn sheet(school: &School, statuses: [&str; 2]) -> Value {
    json!({
        "classId": school.class_id,
        "date": DATE,
        "day": "saturday",
        "period": 1,
        "attendances": [
            { "studentId": school.students[0], "status": statuses[0] },
            { "studentId": school.students[1], "status": statuses[1] },
        ],
    })
}

fn by_name(extra: Value) -> Value {
    let mut body = json!({ "className": "10-A", "date": DATE, "day": "saturday", "period": 1 });
    if let (Some(b), Some(e)) = (body.as_object_mut(), extra.as_object()) {
        b.extend(e.clone());
    }
    body
}

#[test]
fn teacher_submits_then_deputy_and_principal_confirm() {
    let mut state = open_state("schoold-attendance-chain");
    let s = school(&mut state);

    let missing = request_ok(
        &mut state,
        Request::get(format!("/api/class/missing-attendance/{DATE}")).with_bearer(&s.admin),
    );
    assert_eq!(missing.as_array().map(Vec::len), Some(1));

    request_ok(
        &mut state,
        Request::post("/api/class/attendance", sheet(&s, ["present", "absent"])).with_bearer(&s.teacher),
    );
    // Resubmitting before confirmation replaces the entries.
    request_ok(
        &mut state,
        Request::post("/api/class/attendance", sheet(&s, ["present", "late"])).with_bearer(&s.teacher),
    );

    let missing = request_ok(
        &mut state,
        Request::get(format!("/api/class/missing-attendance/{DATE}")).with_bearer(&s.admin),
    );
    assert_eq!(missing.as_array().map(Vec::len), Some(0));

    let (status, _) = request_err(
        &mut state,
        Request::post("/api/class/attendance/confirm-principal", by_name(json!({}))).with_bearer(&s.admin),
    );
    assert_eq!(status, 409);

    request_ok(
        &mut state,
        Request::post("/api/class/attendance/confirm-deputy", by_name(json!({}))).with_bearer(&s.admin),
    );
    let (status, code) = request_err(
        &mut state,
        Request::post("/api/class/attendance", sheet(&s, ["absent", "absent"])).with_bearer(&s.teacher),
    );
    assert_eq!((status, code.as_str()), (403, "locked"));

    request_ok(
        &mut state,
        Request::post("/api/class/attendance/confirm-principal", by_name(json!({}))).with_bearer(&s.admin),
    );

    let confirmed = request_ok(
        &mut state,
        Request::get("/api/class/attendance-reports")
            .with_query("status", "confirmed")
            .with_bearer(&s.admin),
    );
    // No report text was filed, so nothing shows up in the reports view.
    assert_eq!(confirmed.as_array().map(Vec::len), Some(0));

    let student = otp_login(&mut state, "student", "student_phone", &student_phone(2));
    let token = student["token"].as_str().expect("token").to_string();
    let history = request_ok(&mut state, Request::get("/api/student/me/attendance").with_bearer(&token));
    assert_eq!(history[0]["status"], "late");
    assert_eq!(history[0]["subject"], "Math");
    assert_eq!(history[0]["className"], "10-A");
}

#[test]
fn only_the_scheduled_teacher_or_the_deputy_may_write() {
    let mut state = open_state("schoold-attendance-authz");
    let s = school(&mut state);
    let (_, other_teacher) = teacher_with_token(&mut state, &s.admin, 2);
    let clerk = staff_token(&mut state, &s.admin, "clerk", "09121000020", &["manage_students"]);
    let deputy = staff_token(&mut state, &s.admin, "deputy", "09121000021", &["disciplinary_deputy"]);

    let (status, _) = request_err(
        &mut state,
        Request::post("/api/class/attendance", sheet(&s, ["present", "present"])),
    );
    assert_eq!(status, 401);

    let (status, _) = request_err(
        &mut state,
        Request::post("/api/class/attendance", sheet(&s, ["present", "present"])).with_bearer(&other_teacher),
    );
    assert_eq!(status, 403);

    let (status, _) = request_err(
        &mut state,
        Request::post("/api/class/attendance", sheet(&s, ["present", "present"])).with_bearer(&clerk),
    );
    assert_eq!(status, 403);

    request_ok(
        &mut state,
        Request::post("/api/class/attendance", sheet(&s, ["present", "present"])).with_bearer(&deputy),
    );
}

#[test]
fn submissions_are_validated_against_class_and_timetable() {
    let mut state = open_state("schoold-attendance-validation");
    let s = school(&mut state);

    let mut partial = sheet(&s, ["present", "present"]);
    partial["attendances"] = json!([{ "studentId": s.students[0], "status": "present" }]);
    let (status, _) = request_err(
        &mut state,
        Request::post("/api/class/attendance", partial).with_bearer(&s.teacher),
    );
    assert_eq!(status, 400);

    let (status, _) = request_err(
        &mut state,
        Request::post("/api/class/attendance", sheet(&s, ["present", "asleep"])).with_bearer(&s.teacher),
    );
    assert_eq!(status, 400);

    let mut unscheduled = sheet(&s, ["present", "present"]);
    unscheduled["period"] = json!(2);
    let (status, _) = request_err(
        &mut state,
        Request::post("/api/class/attendance", unscheduled).with_bearer(&s.teacher),
    );
    assert_eq!(status, 400);

    let mut bad_date = sheet(&s, ["present", "present"]);
    bad_date["date"] = json!("17/10/2026");
    let (status, _) = request_err(
        &mut state,
        Request::post("/api/class/attendance", bad_date).with_bearer(&s.teacher),
    );
    assert_eq!(status, 400);

    let mut no_class = sheet(&s, ["present", "present"]);
    no_class["classId"] = json!("missing");
    let (status, _) = request_err(
        &mut state,
        Request::post("/api/class/attendance", no_class).with_bearer(&s.teacher),
    );
    assert_eq!(status, 404);
}

#[test]
fn reports_and_deputy_corrections_flow_into_listings() {
    let mut state = open_state("schoold-attendance-reports");
    let s = school(&mut state);

    let (status, _) = request_err(
        &mut state,
        Request::post("/api/class/attendance/report", json!({
            "classId": s.class_id, "date": DATE, "day": "saturday", "period": 1, "report": "late bus",
        }))
        .with_bearer(&s.teacher),
    );
    assert_eq!(status, 404);

    request_ok(
        &mut state,
        Request::post("/api/class/attendance", sheet(&s, ["absent", "absent"])).with_bearer(&s.teacher),
    );
    request_ok(
        &mut state,
        Request::post("/api/class/attendance/report", json!({
            "classId": s.class_id, "date": DATE, "day": "saturday", "period": 1, "report": "late bus",
        }))
        .with_bearer(&s.teacher),
    );

    let pending = request_ok(
        &mut state,
        Request::get("/api/class/attendance-reports")
            .with_query("status", "unconfirmed")
            .with_bearer(&s.admin),
    );
    assert_eq!(pending.as_array().map(Vec::len), Some(1));

    let (status, _) = request_err(
        &mut state,
        Request::get("/api/class/attendance-reports")
            .with_query("status", "someday")
            .with_bearer(&s.admin),
    );
    assert_eq!(status, 400);

    let attendances = json!([
        { "studentId": s.students[0], "status": "present" },
        { "studentId": s.students[1], "status": "absent" },
    ]);
    request_ok(
        &mut state,
        Request::post(
            "/api/class/attendance/deputy-update",
            by_name(json!({ "attendances": attendances })),
        )
        .with_bearer(&s.admin),
    );

    let history = request_ok(
        &mut state,
        Request::get(format!("/api/student/{}/attendance", national_code(1))).with_bearer(&s.admin),
    );
    assert_eq!(history[0]["status"], "present");

    let day = request_ok(
        &mut state,
        Request::get(format!("/api/class/attendance/{DATE}")).with_bearer(&s.admin),
    );
    assert_eq!(day[0]["className"], "10-A");
}

#[test]
fn deputy_confirmation_locks_reports_and_corrections() {
    let mut state = open_state("schoold-attendance-locked");
    let s = school(&mut state);
    request_ok(
        &mut state,
        Request::post("/api/class/attendance", sheet(&s, ["absent", "late"])).with_bearer(&s.teacher),
    );
    request_ok(
        &mut state,
        Request::post("/api/class/attendance/report", json!({
            "classId": s.class_id, "date": DATE, "day": "saturday", "period": 1, "report": "quiet class",
        }))
        .with_bearer(&s.teacher),
    );
    request_ok(
        &mut state,
        Request::post("/api/class/attendance/confirm-deputy", by_name(json!({}))).with_bearer(&s.admin),
    );
    let before = request_ok(
        &mut state,
        Request::get(format!("/api/class/attendance/{DATE}")).with_bearer(&s.admin),
    );

    let (status, code) = request_err(
        &mut state,
        Request::post("/api/class/attendance/report", json!({
            "classId": s.class_id, "date": DATE, "day": "saturday", "period": 1, "report": "rewritten",
        }))
        .with_bearer(&s.teacher),
    );
    assert_eq!((status, code.as_str()), (403, "locked"));

    let attendances = json!([
        { "studentId": s.students[0], "status": "present" },
        { "studentId": s.students[1], "status": "present" },
    ]);
    let (status, code) = request_err(
        &mut state,
        Request::post(
            "/api/class/attendance/deputy-update",
            by_name(json!({ "attendances": attendances, "report": "rewritten" })),
        )
        .with_bearer(&s.admin),
    );
    assert_eq!((status, code.as_str()), (403, "locked"));

    let after = request_ok(
        &mut state,
        Request::get(format!("/api/class/attendance/{DATE}")).with_bearer(&s.admin),
    );
    assert_eq!(before, after);
    let record = &after[0]["attendance"][0];
    assert_eq!(record["report"], "quiet class");
    assert_eq!(record["studentsAttendance"][0]["status"], "absent");
    assert_eq!(record["studentsAttendance"][1]["status"], "late");
}

#[test]
fn attendance_by_date_rejects_malformed_dates() {
    let mut state = open_state("schoold-attendance-by-date");
    let s = school(&mut state);
    for date in ["17-10-2026", "2026-13-01"] {
        let (status, _) = request_err(
            &mut state,
            Request::get(format!("/api/class/attendance/{date}")).with_bearer(&s.admin),
        );
        assert_eq!(status, 400, "{date}");
    }
    let empty = request_ok(
        &mut state,
        Request::get(format!("/api/class/attendance/{DATE}")).with_bearer(&s.admin),
    );
    assert_eq!(empty.as_array().map(Vec::len), Some(0));
}
