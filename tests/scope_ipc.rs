mod test_support;

use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::BTreeSet;
use test_support::Sidecar;

struct School {
    sc: Sidecar,
    admin: String,
    advisor: String,
    ana: String,
    ben: String,
    carl: String,
    dina: String,
    emil: String,
}

fn school(prefix: &str) -> School {
    let mut sc = Sidecar::with_workspace(prefix);
    let admin = sc.bootstrap_admin();
    let ana = sc.create_student(&admin, "Abad", "Ana", "7", "Archimedes", None);
    let ben = sc.create_student(&admin, "Bautista", "Ben", "7", "Archimedes", None);
    let carl = sc.create_student(&admin, "Cruz", "Carl", "7", "Banneker", None);
    let dina = sc.create_student(&admin, "Dizon", "Dina", "11", "Rizal", Some("stem"));
    let emil = sc.create_student(&admin, "Espino", "Emil", "11", "Rizal", Some("ABM"));
    sc.request_ok(
        "subjects.set",
        json!({ "userId": admin, "subjects": ["Math", "Science", "English"] }),
    );
    let advisor = sc.create_advisor(
        &admin,
        "Ms. Reyes",
        json!([
            { "yearLevel": "7", "section": "Archimedes", "subjects": ["Math"] },
            { "yearLevel": "7", "section": "Archimedes", "subjects": ["Science"] },
            { "yearLevel": "11", "section": "Rizal", "strand": "stem", "subjects": ["Math"] }
        ]),
    );
    School {
        sc,
        admin,
        advisor,
        ana,
        ben,
        carl,
        dina,
        emil,
    }
}

fn student_ids(res: &serde_json::Value) -> BTreeSet<String> {
    res["students"]
        .as_array()
        .expect("students")
        .iter()
        .map(|s| s["id"].as_str().expect("id").to_string())
        .collect()
}

#[test]
fn advisor_sees_only_assigned_students_once() {
    let mut s = school("gradebookd-scope-students");
    let res = s.sc.request_ok("students.list", json!({ "userId": s.advisor }));
    let students = res["students"].as_array().expect("students");
    assert_eq!(students.len(), 3);
    assert_eq!(
        student_ids(&res),
        BTreeSet::from([s.ana.clone(), s.ben.clone(), s.dina.clone()])
    );

    let res = s.sc.request_ok("students.list", json!({ "userId": s.admin }));
    assert_eq!(
        student_ids(&res),
        BTreeSet::from([s.ana, s.ben, s.carl, s.dina, s.emil])
    );
}

#[test]
fn advisor_without_assignments_sees_nothing() {
    let mut s = school("gradebookd-scope-fail-closed");
    let admin = s.admin.clone();
    let idle = s.sc.create_advisor(&admin, "Mr. Santos", json!([]));
    let res = s.sc.request_ok("students.list", json!({ "userId": idle }));
    assert_eq!(res["students"].as_array().map(|a| a.len()), Some(0));

    let res = s.sc.request_ok("subjects.list", json!({ "userId": idle, "yearLevel": "7" }));
    assert_eq!(res["subjects"], json!([]));
}

#[test]
fn subjects_are_scoped_by_year_level() {
    let mut s = school("gradebookd-scope-subjects");
    let res = s
        .sc
        .request_ok("subjects.list", json!({ "userId": s.advisor, "yearLevel": "7" }));
    assert_eq!(res["subjects"], json!(["Math", "Science"]));

    let res = s
        .sc
        .request_ok("subjects.list", json!({ "userId": s.advisor, "yearLevel": "8" }));
    assert_eq!(res["subjects"], json!([]));

    let res = s
        .sc
        .request_ok("subjects.list", json!({ "userId": s.admin, "yearLevel": "8" }));
    assert_eq!(res["subjects"], json!(["English", "Math", "Science"]));

    assert_eq!(
        s.sc.request_err("subjects.list", json!({ "userId": s.advisor })),
        "bad_params"
    );
}

#[test]
fn advisor_writes_are_limited_to_assignments() {
    let mut s = school("gradebookd-scope-writes");
    let scores = json!({ "writtenWork": 88, "performanceTask": 88, "quarterlyAssessment": 88 });
    let upsert = |student: &str, subject: &str| {
        json!({
            "userId": s.advisor,
            "studentId": student,
            "subject": subject,
            "quarter": 1,
            "scores": scores
        })
    };

    let ok_ana = upsert(&s.ana, "Science");
    let other_section = upsert(&s.carl, "Math");
    let other_strand = upsert(&s.emil, "Math");
    let unlisted_subject = upsert(&s.dina, "Science");
    let ok_dina = upsert(&s.dina, "Math");

    s.sc.request_ok("grades.upsert", ok_ana);
    s.sc.request_ok("grades.upsert", ok_dina);
    assert_eq!(s.sc.request_err("grades.upsert", other_section), "forbidden");
    assert_eq!(s.sc.request_err("grades.upsert", other_strand), "forbidden");
    assert_eq!(s.sc.request_err("grades.upsert", unlisted_subject), "forbidden");

    assert_eq!(
        s.sc.request_err(
            "students.create",
            json!({
                "userId": s.advisor,
                "lastName": "Flores",
                "firstName": "Fe",
                "yearLevel": "7",
                "section": "Archimedes"
            })
        ),
        "forbidden"
    );
    assert_eq!(
        s.sc.request_err(
            "grades.studentReport",
            json!({ "userId": s.advisor, "studentId": s.carl })
        ),
        "forbidden"
    );
}

#[test]
fn grade_listings_follow_viewer_scope() {
    let mut s = school("gradebookd-scope-grades");
    let scores = json!({ "writtenWork": 80, "performanceTask": 80, "quarterlyAssessment": 80 });
    for student in [&s.ana, &s.carl, &s.emil] {
        s.sc.request_ok(
            "grades.upsert",
            json!({
                "userId": s.admin,
                "studentId": student,
                "subject": "Math",
                "quarter": 1,
                "scores": scores
            }),
        );
    }

    let res = s.sc.request_ok("grades.list", json!({ "userId": s.advisor }));
    let grades = res["grades"].as_array().expect("grades");
    assert_eq!(grades.len(), 1);
    assert_eq!(grades[0]["studentId"].as_str(), Some(s.ana.as_str()));

    let res = s.sc.request_ok("grades.list", json!({ "userId": s.admin }));
    assert_eq!(res["grades"].as_array().map(|a| a.len()), Some(3));
}

#[test]
fn assignment_and_user_maintenance_rules() {
    let mut s = school("gradebookd-scope-users");

    let res = s.sc.request_ok("assignments.list", json!({ "userId": s.advisor }));
    let assignments = res["assignments"].as_array().expect("assignments");
    assert_eq!(assignments.len(), 3);
    assert_eq!(assignments[2]["strand"], "STEM");

    assert_eq!(
        s.sc.request_err(
            "assignments.list",
            json!({ "userId": s.advisor, "targetUserId": s.admin })
        ),
        "forbidden"
    );
    assert_eq!(
        s.sc.request_err(
            "assignments.set",
            json!({
                "userId": s.admin,
                "targetUserId": s.advisor,
                "assignments": [{ "yearLevel": "8", "section": "Curie", "strand": "STEM" }]
            })
        ),
        "bad_params"
    );
    assert_eq!(
        s.sc.request_err(
            "assignments.set",
            json!({
                "userId": s.admin,
                "targetUserId": s.admin,
                "assignments": []
            })
        ),
        "bad_params"
    );
    assert_eq!(
        s.sc.request_err("users.list", json!({ "userId": s.advisor })),
        "forbidden"
    );
    assert_eq!(
        s.sc.request_err(
            "users.delete",
            json!({ "userId": s.admin, "targetUserId": s.admin })
        ),
        "bad_params"
    );

    s.sc.request_ok(
        "users.delete",
        json!({ "userId": s.admin, "targetUserId": s.advisor }),
    );
    assert_eq!(
        s.sc.request_err("students.list", json!({ "userId": s.advisor })),
        "not_found"
    );
}

#[test]
fn first_user_must_be_admin() {
    let mut sc = Sidecar::with_workspace("gradebookd-scope-bootstrap");
    assert_eq!(
        sc.request_err(
            "users.upsert",
            json!({ "displayName": "Teacher", "role": "advisor" })
        ),
        "bad_params"
    );
    let admin = sc.bootstrap_admin();
    // Once an admin exists, anonymous user creation is refused.
    assert_eq!(
        sc.request_err(
            "users.upsert",
            json!({ "displayName": "Intruder", "role": "admin" })
        ),
        "bad_params"
    );
    let res = sc.request_ok("users.list", json!({ "userId": admin }));
    assert_eq!(res["users"].as_array().map(|a| a.len()), Some(1));
}
