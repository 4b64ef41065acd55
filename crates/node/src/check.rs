//! Check runners.
//!
//! `benchnet_common::check` parses and validates the token form; this
//! module actually performs the probes. Every runner produces a
//! [`CheckResult`] with the failure flag, library error string, and the
//! observable output of the probe; [`run`] stamps job id, start time,
//! and elapsed time on top.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tracing::debug;

use benchnet_common::check::{parse, Check};
use benchnet_common::{CheckResult, RES_FAIL};

/// Runs the check described by `tokens` for job `id`.
pub async fn run(id: u64, tokens: &[String]) -> CheckResult {
    let start = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64;
    let t0 = Instant::now();
    let mut result = match parse(tokens) {
        Ok(check) => execute(check).await,
        Err(e) => CheckResult::fail(e.to_string()),
    };
    result.job_id = id;
    result.start = start;
    result.rt = t0.elapsed().as_nanos() as i64;
    debug!("job {id}: check done, flags {}", result.flags);
    result
}

async fn execute(check: Check) -> CheckResult {
    match check {
        Check::Dns { host } => dns_lookup(&host).await,
        Check::HttpGet { url } => http(Method::Get, &url, "").await,
        Check::HttpHead { url } => http(Method::Head, &url, "").await,
        Check::HttpPost { url, body } => http(Method::Post, &url, &body).await,
    }
}

async fn dns_lookup(host: &str) -> CheckResult {
    // lookup_host wants a port; any will do
    match tokio::net::lookup_host((host, 0)).await {
        Ok(addrs) => CheckResult {
            output: addrs.map(|a| a.ip().to_string()).collect(),
            ..CheckResult::default()
        },
        Err(e) => CheckResult::fail(e.to_string()),
    }
}

enum Method {
    Get,
    Head,
    Post,
}

/// Performs the request; the failure flag is set unless the status is
/// exactly 200. Output is the status line plus request and response
/// dumps.
async fn http(method: Method, url: &str, body: &str) -> CheckResult {
    let client = reqwest::Client::new();
    let builder = match method {
        Method::Get => client.get(url),
        Method::Head => client.head(url),
        Method::Post => client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(body.to_string()),
    };
    let request = match builder.build() {
        Ok(r) => r,
        Err(e) => return CheckResult::fail(e.to_string()),
    };
    let request_dump = dump_request(&request);
    let response = match client.execute(request).await {
        Ok(r) => r,
        Err(e) => return CheckResult::fail(e.to_string()),
    };
    let status_line = format!("{:?} {}", response.version(), response.status());
    let response_dump = dump_response(&response);
    let flags = if response.status().as_u16() == 200 { 0 } else { RES_FAIL };
    CheckResult {
        flags,
        output: vec![status_line, request_dump, response_dump],
        ..CheckResult::default()
    }
}

fn dump_request(req: &reqwest::Request) -> String {
    let mut out = format!(
        "{} {} HTTP/1.1\r\n",
        req.method(),
        req.url().path()
    );
    if let Some(host) = req.url().host_str() {
        out.push_str(&format!("Host: {host}\r\n"));
    }
    for (name, value) in req.headers() {
        out.push_str(&format!("{name}: {}\r\n", value.to_str().unwrap_or("?")));
    }
    out.push_str("\r\n");
    out
}

fn dump_response(resp: &reqwest::Response) -> String {
    let mut out = format!("{:?} {}\r\n", resp.version(), resp.status());
    for (name, value) in resp.headers() {
        out.push_str(&format!("{name}: {}\r\n", value.to_str().unwrap_or("?")));
    }
    out.push_str("\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(s: &[&str]) -> Vec<String> {
        s.iter().map(|t| t.to_string()).collect()
    }

    #[tokio::test]
    async fn malformed_command_fails_without_io() {
        let r = run(7, &toks(&["dns"])).await;
        assert!(r.failed());
        assert_eq!(r.errs, "wrong number of parameters");
        assert_eq!(r.job_id, 7);
        assert!(r.start > 0);

        let r = run(7, &toks(&["icmp", "x"])).await;
        assert!(r.failed());
        assert_eq!(r.errs, "unknown check");
    }

    #[tokio::test]
    async fn dns_localhost_resolves() {
        let r = run(1, &toks(&["dns", "localhost"])).await;
        assert!(!r.failed(), "errs: {}", r.errs);
        assert!(!r.output.is_empty());
    }

    #[tokio::test]
    async fn dns_bogus_host_fails() {
        let r = run(1, &toks(&["dns", "definitely.not.a.host.invalid"])).await;
        assert!(r.failed());
        assert!(!r.errs.is_empty());
    }

    #[tokio::test]
    async fn http_get_against_local_server() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).await;
            let _ = sock
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await;
        });
        let r = run(1, &toks(&["http", "get", &format!("http://{addr}/")])).await;
        assert!(!r.failed(), "errs: {}", r.errs);
        assert_eq!(r.output.len(), 3);
        assert!(r.output[0].contains("200"), "status line: {}", r.output[0]);
        assert!(r.output[1].starts_with("GET / HTTP/1.1"), "request dump: {}", r.output[1]);
    }

    #[tokio::test]
    async fn http_non_200_sets_failure() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).await;
            let _ = sock
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
                .await;
        });
        let r = run(1, &toks(&["http", "head", &format!("http://{addr}/")])).await;
        assert!(r.failed());
        assert!(r.output[0].contains("404"));
    }

    #[tokio::test]
    async fn http_connection_refused_fails() {
        let r = run(1, &toks(&["http", "get", "http://127.0.0.1:1/"])).await;
        assert!(r.failed());
        assert!(!r.errs.is_empty());
    }
}
