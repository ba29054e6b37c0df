mod test_support;

use pretty_assertions::assert_eq;
use serde_json::json;
use test_support::Sidecar;

#[test]
fn setup_get_returns_defaults_for_fresh_workspace() {
    let mut sc = Sidecar::with_workspace("gradebookd-setup-defaults");
    let res = sc.request_ok("setup.get", json!({}));
    assert_eq!(
        res["grading"],
        json!({ "writtenWork": 0.25, "performanceTask": 0.5, "quarterlyAssessment": 0.25 })
    );
    assert_eq!(res["attendance"]["presentCode"], "P");
    assert_eq!(res["attendance"]["countLateAsPresent"], true);
    assert_eq!(res["analytics"]["topStudentCount"], 10);
    assert_eq!(res["analytics"]["includeInactiveStudents"], false);
}

#[test]
fn setup_update_persists_and_validates() {
    let mut sc = Sidecar::with_workspace("gradebookd-setup-update");
    let admin = sc.bootstrap_admin();

    let res = sc.request_ok(
        "setup.update",
        json!({
            "userId": admin,
            "section": "attendance",
            "patch": { "lateCode": "t", "countLateAsPresent": false }
        }),
    );
    assert_eq!(res["value"]["lateCode"], "T");

    let res = sc.request_ok("setup.get", json!({}));
    assert_eq!(res["attendance"]["lateCode"], "T");
    assert_eq!(res["attendance"]["countLateAsPresent"], false);

    let rejected = [
        ("grading", json!({ "writtenWork": 0.30 })),
        ("grading", json!({ "writtenWork": "lots" })),
        ("attendance", json!({ "absentCode": "P" })),
        ("analytics", json!({ "topStudentCount": 0 })),
        ("analytics", json!({ "unknownKey": true })),
    ];
    for (section, patch) in rejected {
        assert_eq!(
            sc.request_err(
                "setup.update",
                json!({ "userId": admin, "section": section, "patch": patch })
            ),
            "bad_params",
            "{} {}",
            section,
            patch
        );
    }
    assert_eq!(
        sc.request_err(
            "setup.update",
            json!({ "userId": admin, "section": "backups", "patch": {} })
        ),
        "bad_params"
    );

    // Failed patches leave stored values untouched.
    let res = sc.request_ok("setup.get", json!({}));
    assert_eq!(res["grading"]["writtenWork"].as_f64(), Some(0.25));
}

#[test]
fn setup_update_requires_admin() {
    let mut sc = Sidecar::with_workspace("gradebookd-setup-admin");
    let admin = sc.bootstrap_admin();
    let advisor = sc.create_advisor(&admin, "Ms. Reyes", json!([]));
    assert_eq!(
        sc.request_err(
            "setup.update",
            json!({
                "userId": advisor,
                "section": "analytics",
                "patch": { "topStudentCount": 5 }
            })
        ),
        "forbidden"
    );
}
