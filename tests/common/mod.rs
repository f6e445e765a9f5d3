//! A scripted task broker on a local port: `/healthz`, `/runners/auth`, and the
//! `/runners/_ws` handshake.

#![allow(dead_code)]

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use serde_json::{Value, json};
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::StatusCode;
use tungstenite::http::header::AUTHORIZATION;
use tungstenite::{Message, WebSocket};

/// What the broker does on one WebSocket connection.
#[derive(Debug, Clone)]
pub enum WsScript {
    /// Run the whole handshake and accept the offer for `task_id`.
    Accept { task_id: &'static str },
    /// Ask for runner info, then drop the socket without a close frame.
    DropAfterInfo,
    /// Send a single text message of this many bytes.
    Oversized(usize),
}

#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// `/healthz` answers 503 this many times before 200.
    pub healthz_failures: usize,
    /// `/runners/auth` always answers 401.
    pub reject_auth: bool,
    /// One script per WebSocket connection; the last repeats.
    pub ws: Vec<WsScript>,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            healthz_failures: 0,
            reject_auth: false,
            ws: vec![WsScript::Accept { task_id: "task-1" }],
        }
    }
}

#[derive(Debug, Default)]
pub struct Recorded {
    pub healthz_calls: usize,
    /// Request bodies sent to `/runners/auth`.
    pub auth_requests: Vec<Value>,
    pub grant_tokens_issued: usize,
    /// `(authorization header, query string)` per WebSocket upgrade.
    pub ws_upgrades: Vec<(String, String)>,
    /// Every message the launcher sent over the WebSocket.
    pub ws_messages: Vec<Value>,
}

pub struct FakeBroker {
    pub uri: String,
    recorded: Arc<Mutex<Recorded>>,
}

impl FakeBroker {
    pub fn start(options: BrokerOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let uri = format!("http://{}", listener.local_addr().unwrap());
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let options = Arc::new(options);

        let shared = Arc::clone(&recorded);
        thread::spawn(move || {
            let mut ws_connections = 0;
            for stream in listener.incoming() {
                let Ok(stream) = stream else { return };
                let recorded = Arc::clone(&shared);
                let options = Arc::clone(&options);
                if is_websocket(&stream) {
                    let script = options
                        .ws
                        .get(ws_connections)
                        .or_else(|| options.ws.last())
                        .cloned()
                        .unwrap_or(WsScript::DropAfterInfo);
                    ws_connections += 1;
                    thread::spawn(move || serve_ws(stream, &script, &recorded));
                } else {
                    thread::spawn(move || serve_http(stream, &options, &recorded));
                }
            }
        });

        Self { uri, recorded }
    }

    pub fn recorded(&self) -> MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap()
    }

    /// Poll until `ready` holds; the broker's threads may lag the launcher.
    pub fn wait_until(&self, ready: impl Fn(&Recorded) -> bool) -> MutexGuard<'_, Recorded> {
        for _ in 0..500 {
            let rec = self.recorded();
            if ready(&rec) {
                return rec;
            }
            drop(rec);
            thread::sleep(Duration::from_millis(10));
        }
        panic!("broker never reached expected state: {:?}", *self.recorded());
    }
}

/// A URI nothing listens on.
pub fn closed_port_uri() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

fn is_websocket(stream: &TcpStream) -> bool {
    const PREFIX: &[u8] = b"GET /runners/_ws";
    let mut buf = [0u8; 16];
    for _ in 0..200 {
        match stream.peek(&mut buf) {
            Ok(0) | Err(_) => return false,
            Ok(n) if n >= PREFIX.len() => return &buf[..] == PREFIX,
            Ok(_) => thread::sleep(Duration::from_millis(1)),
        }
    }
    false
}

fn serve_http(stream: TcpStream, options: &BrokerOptions, recorded: &Mutex<Recorded>) {
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).is_err() {
        return;
    }
    let mut content_length = 0;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).is_err() || line == "\r\n" || line.is_empty() {
            break;
        }
        if let Some(v) = line.to_ascii_lowercase().strip_prefix("content-length:") {
            content_length = v.trim().parse().unwrap_or(0);
        }
    }
    let mut body = vec![0; content_length];
    if reader.read_exact(&mut body).is_err() {
        return;
    }

    let path = request_line.split_whitespace().nth(1).unwrap_or("");
    let (status, response) = match path {
        "/healthz" => {
            let mut rec = recorded.lock().unwrap();
            rec.healthz_calls += 1;
            if rec.healthz_calls <= options.healthz_failures {
                (503, json!({"status": "starting"}))
            } else {
                (200, json!({"status": "ok"}))
            }
        }
        "/runners/auth" => {
            let mut rec = recorded.lock().unwrap();
            rec.auth_requests
                .push(serde_json::from_slice(&body).unwrap_or(Value::Null));
            if options.reject_auth {
                (401, json!({"message": "unauthorized"}))
            } else {
                rec.grant_tokens_issued += 1;
                let token = format!("grant-{}", rec.grant_tokens_issued);
                (200, json!({"data": {"token": token}}))
            }
        }
        _ => (404, json!({})),
    };

    let response = response.to_string();
    let mut stream = reader.into_inner();
    let _ = write!(
        stream,
        "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{response}",
        response.len()
    );
}

fn serve_ws(stream: TcpStream, script: &WsScript, recorded: &Arc<Mutex<Recorded>>) {
    let upgrades = Arc::clone(recorded);
    let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        let auth = req
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let query = req.uri().query().unwrap_or_default().to_string();
        let authorized = auth.starts_with("Bearer grant-");
        upgrades.lock().unwrap().ws_upgrades.push((auth, query));
        if authorized {
            Ok(resp)
        } else {
            let mut err = ErrorResponse::new(Some("unauthorized".into()));
            *err.status_mut() = StatusCode::UNAUTHORIZED;
            Err(err)
        }
    };
    let Ok(mut ws) = tungstenite::accept_hdr(stream, callback) else {
        return;
    };

    match script {
        WsScript::Accept { task_id } => {
            send(&mut ws, &json!({"type": "broker:inforequest"}));
            if recv(&mut ws, recorded).is_none() {
                return;
            }
            send(&mut ws, &json!({"type": "broker:runnerregistered"}));
            let Some(offer) = recv(&mut ws, recorded) else {
                return;
            };
            send(
                &mut ws,
                &json!({
                    "type": "broker:taskofferaccept",
                    "taskId": task_id,
                    "offerId": offer["offerId"],
                }),
            );
            let _ = recv(&mut ws, recorded);
            drain(&mut ws);
        }
        WsScript::DropAfterInfo => {
            send(&mut ws, &json!({"type": "broker:inforequest"}));
            let _ = recv(&mut ws, recorded);
            drop(ws);
        }
        WsScript::Oversized(size) => {
            let _ = ws.send(Message::text("x".repeat(*size)));
            drain(&mut ws);
        }
    }
}

fn send(ws: &mut WebSocket<TcpStream>, msg: &Value) {
    let _ = ws.send(Message::text(msg.to_string()));
}

/// Next text message from the launcher, recorded.
fn recv(ws: &mut WebSocket<TcpStream>, recorded: &Mutex<Recorded>) -> Option<Value> {
    loop {
        match ws.read() {
            Ok(Message::Text(text)) => {
                let msg: Value = serde_json::from_str(text.as_str()).ok()?;
                recorded.lock().unwrap().ws_messages.push(msg.clone());
                return Some(msg);
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

/// Read until the launcher closes.
fn drain(ws: &mut WebSocket<TcpStream>) {
    loop {
        match ws.read() {
            Ok(Message::Close(_)) | Err(_) => return,
            Ok(_) => {}
        }
    }
}
