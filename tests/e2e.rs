use hmac::{Hmac, Mac};
use serde_json::{Value, json};
use sha2::Sha256;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tempfile::TempDir;

type AnyResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;
type HmacSha256 = Hmac<Sha256>;

const SECRET: &str = "e2e-webhook-secret-0123456789abcdef";

#[test]
fn e2e_full_suite() -> AnyResult<()> {
    let env = TestEnv::new()?;
    let mut daemon = env.spawn_daemon()?;
    env.wait_until_healthy()?;

    scenario_health(&env)?;
    scenario_bad_signature(&env)?;
    scenario_stale_timestamp(&env)?;
    scenario_status_errors(&env)?;
    scenario_reinit_job(&env)?;
    scenario_rate_limited(&env)?;
    scenario_sigterm_shutdown(&env, &mut daemon)?;
    Ok(())
}

fn scenario_health(env: &TestEnv) -> AnyResult<()> {
    let response = env.send(HttpRequest::get("/health"))?;
    assert_eq!(response.status, 200);
    let body = response.json_body()?;
    assert_eq!(body["status"], Value::from("healthy"));
    assert_eq!(body["service"], Value::from("cloud-update"));
    Ok(())
}

fn scenario_bad_signature(env: &TestEnv) -> AnyResult<()> {
    let payload = webhook_payload("update", current_unix_secs() as i64);
    let response = env.send(
        HttpRequest::post("/webhook")
            .header("x-cloud-update-signature", "sha256=deadbeef")
            .body(payload),
    )?;
    assert_eq!(response.status, 401, "{}", response.body_text());
    let body = response.json_body()?;
    assert!(body.get("job_id").is_none());
    assert!(!response.body_text().contains("deadbeef"));
    Ok(())
}

fn scenario_stale_timestamp(env: &TestEnv) -> AnyResult<()> {
    let payload = webhook_payload("update", current_unix_secs() as i64 - 600);
    let response = env.send(env.signed_webhook(payload))?;
    assert_eq!(response.status, 400, "{}", response.body_text());
    assert_eq!(response.json_body()?["error"], Value::from("stale_request"));
    Ok(())
}

fn scenario_status_errors(env: &TestEnv) -> AnyResult<()> {
    let missing = env.send(HttpRequest::get("/job/status"))?;
    assert_eq!(missing.status, 400);

    let unknown = env.send(HttpRequest::get("/job/status?id=not-a-job"))?;
    assert_eq!(unknown.status, 404);
    Ok(())
}

fn scenario_reinit_job(env: &TestEnv) -> AnyResult<()> {
    env.clear_mock_log()?;
    let payload = webhook_payload("reinit", current_unix_secs() as i64);
    let response = env.send(env.signed_webhook(payload))?;
    assert_eq!(response.status, 202, "{}", response.body_text());

    let body = response.json_body()?;
    assert_eq!(body["status"], Value::from("accepted"));
    assert_eq!(
        body["message"],
        Value::from("Action 'reinit' queued for processing")
    );
    let job_id = body["job_id"].as_str().ok_or("job_id missing")?.to_string();

    let job = env.wait_for_terminal_job(&job_id)?;
    match job["state"].as_str() {
        Some("succeeded") => {
            let log = env.read_mock_log()?;
            assert!(
                log.iter().any(|line| line == "cloud-init init"),
                "cloud-init invocation recorded: {log:?}"
            );
        }
        Some("failed") => {
            // Hosts the detector cannot classify have no reinit plan.
            let message = job["error_message"].as_str().unwrap_or_default();
            assert!(
                message.contains("unsupported distribution"),
                "unexpected failure: {message}"
            );
        }
        other => panic!("unexpected job state {other:?}"),
    }
    assert!(job["started_at"].is_u64());
    assert!(job["finished_at"].is_u64());
    Ok(())
}

fn scenario_rate_limited(env: &TestEnv) -> AnyResult<()> {
    // Unsigned requests still spend tokens: admission runs before auth.
    for attempt in 0..200 {
        let request = HttpRequest::post("/webhook").body(webhook_payload("update", 0));
        let response = env.send(request)?;
        match response.status {
            401 => continue,
            429 => {
                assert_eq!(response.header("retry-after"), Some("1"));
                assert_eq!(response.json_body()?["error"], Value::from("rate_limited"));
                return Ok(());
            }
            other => panic!("attempt {attempt}: unexpected status {other}"),
        }
    }
    Err("rate limiter never rejected a request".into())
}

fn scenario_sigterm_shutdown(env: &TestEnv, daemon: &mut DaemonProcess) -> AnyResult<()> {
    let status = daemon.terminate(Duration::from_secs(15))?;
    assert!(status.success(), "daemon exit status: {status}");

    let log = fs::read_to_string(&env.log_file)?;
    assert!(log.contains("starting cloud-update"), "log file: {log}");
    assert!(log.contains("shutdown requested"), "log file: {log}");
    assert!(!log.contains(SECRET), "secret leaked into the log");
    Ok(())
}

fn webhook_payload(action: &str, timestamp: i64) -> Vec<u8> {
    json!({
        "action": action,
        "timestamp": timestamp,
    })
    .to_string()
    .into_bytes()
}

fn current_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs()
}

fn free_port() -> AnyResult<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Scripts shadowing the host tools; each appends its argv to the mock log.
const MOCK_PROGRAMS: &[&str] = &[
    "cloud-init",
    "apt-get",
    "apk",
    "dnf",
    "yum",
    "zypper",
    "pacman",
    "reboot",
];

struct TestEnv {
    #[allow(dead_code)]
    temp: TempDir,
    bin_path: PathBuf,
    mock_log: PathBuf,
    log_file: PathBuf,
    path_override: String,
    port: u16,
}

impl TestEnv {
    fn new() -> AnyResult<Self> {
        let temp = TempDir::new()?;
        let root = temp.path().to_path_buf();
        let mock_dir = root.join("mock-bin");
        fs::create_dir_all(&mock_dir)?;
        let mock_log = root.join("mock-log.txt");
        fs::write(&mock_log, b"")?;

        for program in MOCK_PROGRAMS {
            write_script(
                &mock_dir.join(program),
                &format!(
                    "#!/bin/sh\necho \"{program} $*\" >> '{}'\nexit 0\n",
                    mock_log.display()
                ),
            )?;
        }
        // Non-root runs escalate through the first helper on PATH.
        write_script(
            &mock_dir.join("doas"),
            "#!/bin/sh\n[ \"$1\" = \"-n\" ] && shift\nexec \"$@\"\n",
        )?;

        let upstream_path = env::var("PATH").unwrap_or_default();
        let path_override = format!("{}:{}", mock_dir.display(), upstream_path);
        Ok(Self {
            bin_path: PathBuf::from(env!("CARGO_BIN_EXE_cloud-update")),
            mock_log,
            log_file: root.join("logs/cloud-update.log"),
            path_override,
            port: free_port()?,
            temp,
        })
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.bin_path);
        cmd.env("CLOUD_UPDATE_PORT", self.port.to_string());
        cmd.env("CLOUD_UPDATE_SECRET", SECRET);
        cmd.env("CLOUD_UPDATE_LOG_LEVEL", "debug");
        cmd.env("CLOUD_UPDATE_LOG_FILE", &self.log_file);
        cmd.env("PATH", &self.path_override);
        cmd.env_remove("RUST_LOG");
        cmd.env_remove("CLOUD_UPDATE_TLS_ENABLED");
        cmd.env_remove("CLOUD_UPDATE_TLS_AUTO");
        cmd.stdin(Stdio::null());
        cmd
    }

    fn spawn_daemon(&self) -> AnyResult<DaemonProcess> {
        let mut cmd = self.command();
        cmd.stdout(Stdio::null()).stderr(Stdio::null());
        Ok(DaemonProcess(cmd.spawn()?))
    }

    fn addr(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    fn wait_until_healthy(&self) -> AnyResult<()> {
        let mut last_err: Option<String> = None;
        for _ in 0..50 {
            match self.send(HttpRequest::get("/health")) {
                Ok(response) if response.status == 200 => return Ok(()),
                Ok(response) => last_err = Some(format!("status {}", response.status)),
                Err(err) => last_err = Some(err.to_string()),
            }
            thread::sleep(Duration::from_millis(100));
        }
        Err(format!(
            "daemon did not start on {} in time: last_err={last_err:?}",
            self.addr()
        )
        .into())
    }

    fn signed_webhook(&self, payload: Vec<u8>) -> HttpRequest {
        let signature = webhook_signature(&payload);
        HttpRequest::post("/webhook")
            .header("content-type", "application/json")
            .header("x-cloud-update-signature", &signature)
            .body(payload)
    }

    fn wait_for_terminal_job(&self, job_id: &str) -> AnyResult<Value> {
        let deadline = Instant::now() + Duration::from_secs(20);
        loop {
            let response = self.send(HttpRequest::get(&format!("/job/status?id={job_id}")))?;
            assert_eq!(response.status, 200, "{}", response.body_text());
            let job = response.json_body()?;
            if matches!(job["state"].as_str(), Some("succeeded" | "failed")) {
                return Ok(job);
            }
            if Instant::now() > deadline {
                return Err(format!("job {job_id} still {}", job["state"]).into());
            }
            thread::sleep(Duration::from_millis(100));
        }
    }

    fn send(&self, request: HttpRequest) -> AnyResult<HttpResponse> {
        let mut stream = TcpStream::connect(self.addr())?;
        stream.set_read_timeout(Some(Duration::from_secs(10)))?;
        stream.write_all(&request.into_bytes())?;
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf)?;
        HttpResponse::parse(&buf)
    }

    fn clear_mock_log(&self) -> AnyResult<()> {
        fs::write(&self.mock_log, b"")?;
        Ok(())
    }

    fn read_mock_log(&self) -> AnyResult<Vec<String>> {
        let content = fs::read_to_string(&self.mock_log)?;
        Ok(content
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect())
    }
}

fn write_script(path: &Path, contents: &str) -> io::Result<()> {
    fs::write(path, contents)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

fn webhook_signature(body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).unwrap();
    mac.update(body);
    format!("sha256={:x}", mac.finalize().into_bytes())
}

/// Kills the daemon if a scenario fails before the graceful stop.
struct DaemonProcess(Child);

impl DaemonProcess {
    fn terminate(&mut self, timeout: Duration) -> AnyResult<ExitStatus> {
        let pid = i32::try_from(self.0.id())?;
        // SAFETY: signalling a child process we spawned and still own.
        if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
            return Err(io::Error::last_os_error().into());
        }
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.0.try_wait()? {
                return Ok(status);
            }
            if Instant::now() > deadline {
                return Err("daemon did not exit after SIGTERM".into());
            }
            thread::sleep(Duration::from_millis(50));
        }
    }
}

impl Drop for DaemonProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.0.try_wait() {
            let _ = self.0.kill();
            let _ = self.0.wait();
        }
    }
}

struct HttpRequest {
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl HttpRequest {
    fn get(path: &str) -> Self {
        Self::new("GET", path)
    }

    fn post(path: &str) -> Self {
        Self::new("POST", path)
    }

    fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            headers: vec![("host".into(), "localhost".into())],
            body: Vec::new(),
        }
    }

    fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    fn into_bytes(self) -> Vec<u8> {
        let mut lines = Vec::new();
        lines.push(format!("{} {} HTTP/1.1\r\n", self.method, self.path));
        for (name, value) in &self.headers {
            lines.push(format!("{name}: {value}\r\n"));
        }
        lines.push(format!("Content-Length: {}\r\n", self.body.len()));
        lines.push("Connection: close\r\n".into());
        lines.push("\r\n".into());

        let mut payload: Vec<u8> = lines.into_iter().flat_map(|s| s.into_bytes()).collect();
        payload.extend_from_slice(&self.body);
        payload
    }
}

struct HttpResponse {
    status: u16,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl HttpResponse {
    fn parse(raw: &[u8]) -> AnyResult<Self> {
        let split = raw
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
            .ok_or_else(|| io::Error::other("invalid HTTP response"))?;
        let (head, body) = raw.split_at(split + 4);
        let head_str = String::from_utf8_lossy(head);
        let mut lines = head_str.split("\r\n");
        let status_line = lines
            .next()
            .ok_or_else(|| io::Error::other("missing status line"))?;
        let status = status_line
            .split(' ')
            .nth(1)
            .ok_or_else(|| io::Error::other("missing status code"))?
            .parse::<u16>()?;

        let mut headers = HashMap::new();
        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }

        // Body is only decoded for the non-chunked replies the daemon sends.
        Ok(Self {
            status,
            headers,
            body: body.to_vec(),
        })
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    fn json_body(&self) -> AnyResult<Value> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).trim().to_string()
    }
}
