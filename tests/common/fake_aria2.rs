//! Scripted aria2 JSON-RPC endpoint on top of wiremock
//!
//! Every `aria2.addUri` gets the next gid. URLs containing `reject` are
//! refused with an RPC fault, URLs containing `missing` finish with aria2's
//! "resource not found" error, everything else completes on the first poll.

use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

#[derive(Clone, Debug)]
pub struct FakeJob {
    pub gid: String,
    pub urls: Vec<String>,
    pub dir: String,
}

#[derive(Debug, Default)]
struct FakeState {
    jobs: Vec<FakeJob>,
    calls: Vec<String>,
    tokens: Vec<Option<String>>,
}

/// Handle on the fake daemon's recorded state
#[derive(Clone, Default)]
pub struct FakeAria2 {
    state: Arc<Mutex<FakeState>>,
}

impl FakeAria2 {
    /// Start a mock server answering on `/jsonrpc`
    pub async fn start() -> (MockServer, FakeAria2) {
        let server = MockServer::start().await;
        let fake = FakeAria2::default();
        Mock::given(method("POST"))
            .and(path("/jsonrpc"))
            .respond_with(fake.clone())
            .mount(&server)
            .await;
        (server, fake)
    }

    pub fn jobs(&self) -> Vec<FakeJob> {
        self.state.lock().unwrap().jobs.clone()
    }

    /// Method names in call order
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, method: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == method).count()
    }

    /// Token parameter of every call, `None` when it was missing
    pub fn tokens(&self) -> Vec<Option<String>> {
        self.state.lock().unwrap().tokens.clone()
    }

    fn handle(&self, method: &str, params: &[Value]) -> Value {
        let mut state = self.state.lock().unwrap();
        match method {
            "aria2.addUri" => {
                let urls: Vec<String> = params
                    .first()
                    .and_then(Value::as_array)
                    .map(|a| a.iter().filter_map(|u| u.as_str().map(String::from)).collect())
                    .unwrap_or_default();
                if urls.iter().any(|u| u.contains("reject")) {
                    return fault(1, "Could not understand URI");
                }
                let gid = format!("{:016x}", state.jobs.len() + 1);
                let dir = params
                    .get(1)
                    .and_then(|o| o.get("dir"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                state.jobs.push(FakeJob {
                    gid: gid.clone(),
                    urls,
                    dir,
                });
                ok(json!(gid))
            }
            "aria2.tellActive" | "aria2.tellWaiting" => ok(json!([])),
            "aria2.tellStopped" => {
                let offset = params.first().and_then(Value::as_u64).unwrap_or(0) as usize;
                let num = params.get(1).and_then(Value::as_u64).unwrap_or(1000) as usize;
                let stopped: Vec<Value> = state
                    .jobs
                    .iter()
                    .skip(offset)
                    .take(num)
                    .map(stopped_entry)
                    .collect();
                ok(Value::Array(stopped))
            }
            "aria2.getGlobalStat" => ok(json!({
                "downloadSpeed": "0",
                "numActive": "0",
                "numWaiting": "0",
                "numStopped": state.jobs.len().to_string(),
            })),
            "aria2.shutdown" => ok(json!("OK")),
            other => fault(1, &format!("No such method: {other}")),
        }
    }
}

fn stopped_entry(job: &FakeJob) -> Value {
    let name = job.urls[0].rsplit('/').next().unwrap_or("file");
    let path = format!("{}/{name}", job.dir);
    if job.urls[0].contains("missing") {
        json!({
            "gid": job.gid,
            "status": "error",
            "totalLength": "0",
            "completedLength": "0",
            "errorCode": "3",
            "errorMessage": "Resource not found",
            "files": [{ "path": path }],
        })
    } else {
        json!({
            "gid": job.gid,
            "status": "complete",
            "totalLength": "4096",
            "completedLength": "4096",
            "errorCode": "0",
            "files": [{ "path": path }],
        })
    }
}

fn ok(result: Value) -> Value {
    json!({ "result": result })
}

fn fault(code: i64, message: &str) -> Value {
    json!({ "error": { "code": code, "message": message } })
}

impl Respond for FakeAria2 {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).unwrap_or(Value::Null);
        let method = body["method"].as_str().unwrap_or_default().to_string();
        let mut params = body["params"].as_array().cloned().unwrap_or_default();

        let token = match params.first().and_then(Value::as_str) {
            Some(t) if t.starts_with("token:") => Some(t.to_string()),
            _ => None,
        };
        if token.is_some() {
            params.remove(0);
        }

        {
            let mut state = self.state.lock().unwrap();
            state.calls.push(method.clone());
            state.tokens.push(token);
        }

        let mut reply = self.handle(&method, &params);
        reply["jsonrpc"] = json!("2.0");
        reply["id"] = body["id"].clone();
        ResponseTemplate::new(200).set_body_json(reply)
    }
}
