mod test_support;

use pretty_assertions::assert_eq;
use serde_json::json;
use test_support::Sidecar;

#[test]
fn student_lifecycle_and_placement_rules() {
    let mut sc = Sidecar::with_workspace("gradebookd-students-lifecycle");
    let admin = sc.bootstrap_admin();

    let first = sc.request_ok(
        "students.create",
        json!({
            "userId": admin,
            "lastName": "Abad",
            "firstName": "Ana",
            "yearLevel": "12",
            "section": "Bonifacio",
            "strand": " humss ",
            "lrn": "136512345678"
        }),
    );
    assert_eq!(first["sortOrder"], 0);
    let ana = first["studentId"].as_str().expect("studentId").to_string();

    let res = sc.request_ok("students.list", json!({ "userId": admin }));
    let s = &res["students"][0];
    assert_eq!(s["displayName"], "Abad, Ana");
    assert_eq!(s["strand"], "HUMSS");
    assert_eq!(s["active"], true);

    let bad = [
        json!({ "userId": admin, "lastName": "X", "firstName": "Y", "yearLevel": "13", "section": "A" }),
        json!({ "userId": admin, "lastName": "X", "firstName": "Y", "yearLevel": "8", "section": "A", "strand": "STEM" }),
        json!({ "userId": admin, "lastName": "X", "firstName": "Y", "yearLevel": "11", "section": "A" }),
        json!({ "userId": admin, "firstName": "Y", "yearLevel": "8", "section": "A" }),
    ];
    for params in bad {
        assert_eq!(sc.request_err("students.create", params.clone()), "bad_params", "{}", params);
    }

    assert_eq!(
        sc.request_err(
            "students.create",
            json!({
                "userId": admin,
                "lastName": "Bautista",
                "firstName": "Ben",
                "yearLevel": "12",
                "section": "Bonifacio",
                "strand": "STEM",
                "lrn": "136512345678"
            })
        ),
        "conflict"
    );

    sc.request_ok(
        "students.update",
        json!({ "userId": admin, "studentId": ana, "patch": { "active": false, "firstName": "Anna" } }),
    );
    let res = sc.request_ok("students.list", json!({ "userId": admin }));
    assert_eq!(res["students"].as_array().map(|a| a.len()), Some(0));
    let res = sc.request_ok(
        "students.list",
        json!({ "userId": admin, "includeInactive": true }),
    );
    assert_eq!(res["students"][0]["firstName"], "Anna");

    // Moving to junior high without clearing the strand is refused.
    assert_eq!(
        sc.request_err(
            "students.update",
            json!({ "userId": admin, "studentId": ana, "patch": { "yearLevel": "10" } })
        ),
        "bad_params"
    );
    assert_eq!(
        sc.request_err(
            "students.update",
            json!({ "userId": admin, "studentId": ana, "patch": { "nickname": "A" } })
        ),
        "bad_params"
    );

    sc.request_ok("students.delete", json!({ "userId": admin, "studentId": ana }));
    assert_eq!(
        sc.request_err("students.delete", json!({ "userId": admin, "studentId": ana })),
        "not_found"
    );
}

#[test]
fn list_filters_by_year_level_and_section() {
    let mut sc = Sidecar::with_workspace("gradebookd-students-filters");
    let admin = sc.bootstrap_admin();
    sc.create_student(&admin, "Abad", "Ana", "7", "Archimedes", None);
    sc.create_student(&admin, "Bautista", "Ben", "7", "Banneker", None);
    sc.create_student(&admin, "Cruz", "Carl", "10", "Archimedes", None);

    let res = sc.request_ok(
        "students.list",
        json!({ "userId": admin, "yearLevel": "7" }),
    );
    assert_eq!(res["students"].as_array().map(|a| a.len()), Some(2));

    let res = sc.request_ok(
        "students.list",
        json!({ "userId": admin, "section": "Archimedes" }),
    );
    let names: Vec<&str> = res["students"]
        .as_array()
        .expect("students")
        .iter()
        .filter_map(|s| s["lastName"].as_str())
        .collect();
    assert_eq!(names, vec!["Abad", "Cruz"]);
}
