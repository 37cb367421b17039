//! CGI backend client (spec §4.G): "fork+exec of a local process under
//! configured namespace/resource-limit/user options; stdin/stdout are
//! wired to the stream pipeline." `bp_core::CgiAddress` doesn't carry
//! namespace/rlimit/user fields (see bp-core grounding), so this client
//! spawns under whatever `path`/`interpreter`/`action`/`args`/`env` the
//! address does carry.
//!
//! `std::process::Command` is blocking, so the spawn-and-drain runs on
//! `bp-worker`'s `WorkerPool` (spec §4.K) rather than inline on the event
//! loop, with the `async fn` side polling the job's completion channel —
//! the same bridge pattern local-file direct-transfer would need for any
//! blocking syscall on this thread-per-core runtime.

use crate::client::BackendClient;
use crate::request::{BackendRequest, BackendResponse};
use bp_core::{Address, CgiAddress, GatewayError};
use bp_worker::pool::{JobState, SharedWorkerPool, ThreadJob};
use bytes::Bytes;
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::time::Duration;

struct CgiJob {
    cgi: CgiAddress,
    method: &'static str,
    query_string: Option<String>,
    headers: Vec<(String, String)>,
    body: Option<Bytes>,
}

struct CgiOutcome {
    stdout: Vec<u8>,
}

impl ThreadJob for CgiJob {
    type Output = Result<CgiOutcome, GatewayError>;

    fn run(self: Box<Self>) -> Self::Output {
        let program = self.cgi.interpreter.as_deref().unwrap_or(&self.cgi.path);
        let mut command = Command::new(program);
        if self.cgi.interpreter.is_some() {
            command.arg(&self.cgi.path);
        }
        command.args(&self.cgi.args);
        command.stdin(Stdio::piped());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        command.env_clear();
        command.env("GATEWAY_INTERFACE", "CGI/1.1");
        command.env("SERVER_PROTOCOL", "HTTP/1.1");
        command.env("REQUEST_METHOD", self.method);
        if let Some(root) = &self.cgi.document_root {
            command.env("DOCUMENT_ROOT", root);
        }
        if let Some(script_name) = &self.cgi.script_name {
            command.env("SCRIPT_NAME", script_name);
        }
        if let Some(path_info) = &self.cgi.path_info {
            command.env("PATH_INFO", path_info);
        }
        command.env("QUERY_STRING", self.query_string.as_deref().unwrap_or(""));
        for (name, value) in &self.headers {
            let var = format!("HTTP_{}", name.to_uppercase().replace('-', "_"));
            command.env(var, value);
        }
        if let Some(body) = &self.body {
            command.env("CONTENT_LENGTH", body.len().to_string());
        }
        for (name, value) in &self.cgi.env {
            command.env(name, value);
        }

        let mut child = command
            .spawn()
            .map_err(|e| GatewayError::PeerFailure { addr: program.to_string(), detail: e.to_string() })?;

        if let Some(body) = &self.body {
            if let Some(mut stdin) = child.stdin.take() {
                let _ = stdin.write_all(body);
            }
        } else {
            drop(child.stdin.take());
        }

        let mut stdout = Vec::new();
        if let Some(mut out) = child.stdout.take() {
            out.read_to_end(&mut stdout)
                .map_err(|e| GatewayError::PeerFailure { addr: program.to_string(), detail: e.to_string() })?;
        }

        let mut stderr = String::new();
        if let Some(mut err) = child.stderr.take() {
            let _ = err.read_to_string(&mut stderr);
        }
        if !stderr.is_empty() {
            tracing::warn!(target: "cgi", program, stderr = %stderr, "child wrote to stderr");
        }

        let status = child
            .wait()
            .map_err(|e| GatewayError::PeerFailure { addr: program.to_string(), detail: e.to_string() })?;
        if !status.success() {
            tracing::debug!(target: "cgi", program, code = ?status.code(), "child exited non-zero");
        }

        Ok(CgiOutcome { stdout })
    }
}

pub struct CgiClient {
    pool: SharedWorkerPool,
}

impl CgiClient {
    pub fn new(pool: SharedWorkerPool) -> Self {
        CgiClient { pool }
    }

    fn cgi_address(address: &Address) -> Result<&CgiAddress, GatewayError> {
        match address {
            Address::Cgi(cgi) | Address::Pipe(cgi) => Ok(cgi),
            _ => Err(GatewayError::Internal("cgi client given non-CGI address".into())),
        }
    }
}

/// Polls a blocking job's completion without parking this event-loop
/// thread, yielding back to the runtime between checks.
async fn await_job<T: Send + 'static>(handle: bp_worker::pool::JobHandle<T>) -> T {
    loop {
        if handle.state() == JobState::Done {
            if let Ok(value) = handle.try_recv() {
                return value;
            }
        }
        monoio::time::sleep(Duration::from_millis(1)).await;
    }
}

impl BackendClient for CgiClient {
    async fn send_request(&mut self, req: BackendRequest) -> Result<BackendResponse, GatewayError> {
        let cgi = Self::cgi_address(&req.address)?.clone();
        let query_string = cgi.query_string.clone().or_else(|| {
            req.path.split_once('?').map(|(_, q)| q.to_string())
        });

        let job = CgiJob {
            cgi,
            method: req.method.as_str(),
            query_string,
            headers: req.headers.clone(),
            body: req.body.clone(),
        };
        let handle = self.pool.submit(job);
        let outcome = await_job(handle).await?;
        crate::fcgi::parse_cgi_style_response(&outcome.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bp_core::CgiAddress;

    #[test]
    fn test_cgi_address_accepts_cgi_and_pipe_variants() {
        let addr = Address::Cgi(CgiAddress::new("/usr/bin/true"));
        assert!(CgiClient::cgi_address(&addr).is_ok());
        let addr = Address::Pipe(CgiAddress::new("/usr/bin/true"));
        assert!(CgiClient::cgi_address(&addr).is_ok());
    }

    #[test]
    fn test_cgi_address_rejects_other_variants() {
        let addr = Address::None;
        assert!(CgiClient::cgi_address(&addr).is_err());
    }
}
