#![allow(dead_code)]

use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

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

pub struct Sidecar {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Sidecar {
    pub fn spawn() -> Self {
        let exe = env!("CARGO_BIN_EXE_gradebookd");
        let mut child = Command::new(exe)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn gradebookd");
        let stdin = child.stdin.take().expect("child stdin");
        let stdout = child.stdout.take().expect("child stdout");
        Self {
            child,
            stdin,
            reader: BufReader::new(stdout),
            next_id: 0,
        }
    }

    /// Spawns a sidecar with a fresh workspace already selected.
    pub fn with_workspace(prefix: &str) -> Self {
        let mut sc = Self::spawn();
        let workspace = temp_dir(prefix);
        sc.request_ok(
            "workspace.select",
            json!({ "path": workspace.to_string_lossy() }),
        );
        sc
    }

    pub fn send_raw(&mut self, line: &str) -> serde_json::Value {
        writeln!(self.stdin, "{}", line).expect("write request");
        self.stdin.flush().expect("flush request");
        self.read_response()
    }

    fn read_response(&mut self) -> serde_json::Value {
        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read response line");
        assert!(!line.trim().is_empty(), "empty response");
        serde_json::from_str(line.trim()).expect("parse response json")
    }

    pub fn request(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let payload = json!({
            "id": id,
            "method": method,
            "params": params,
        });
        let value = self.send_raw(&payload.to_string());
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
        value
    }

    pub fn request_ok(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let value = self.request(method, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(true),
            "{} failed: {}",
            method,
            value
        );
        value.get("result").cloned().unwrap_or_else(|| json!({}))
    }

    /// Asserts the call failed and returns its error code.
    pub fn request_err(&mut self, method: &str, params: serde_json::Value) -> String {
        let value = self.request(method, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(false),
            "{} unexpectedly succeeded: {}",
            method,
            value
        );
        value
            .pointer("/error/code")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string()
    }

    /// Creates the bootstrap admin and returns its id.
    pub fn bootstrap_admin(&mut self) -> String {
        let res = self.request_ok(
            "users.upsert",
            json!({ "displayName": "Principal", "role": "admin" }),
        );
        res["userId"].as_str().expect("userId").to_string()
    }

    pub fn create_advisor(&mut self, admin: &str, name: &str, assignments: serde_json::Value) -> String {
        let res = self.request_ok(
            "users.upsert",
            json!({ "userId": admin, "displayName": name, "role": "advisor" }),
        );
        let id = res["userId"].as_str().expect("userId").to_string();
        self.request_ok(
            "assignments.set",
            json!({ "userId": admin, "targetUserId": id, "assignments": assignments }),
        );
        id
    }

    pub fn create_student(
        &mut self,
        admin: &str,
        last: &str,
        first: &str,
        year_level: &str,
        section: &str,
        strand: Option<&str>,
    ) -> String {
        let res = self.request_ok(
            "students.create",
            json!({
                "userId": admin,
                "lastName": last,
                "firstName": first,
                "yearLevel": year_level,
                "section": section,
                "strand": strand
            }),
        );
        res["studentId"].as_str().expect("studentId").to_string()
    }
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
