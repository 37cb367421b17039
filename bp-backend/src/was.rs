//! WAS (Web Application Socket) backend client (spec §4.G), grounded on
//! `was/was_client.cxx`'s `WasClient` state machine and its
//! `OnWasControlPacket` command handling (`STATUS` as a 2- or 4-byte
//! status code, `HEADER`/`PARAMETER` as `name=value` payloads, `LENGTH`/
//! `PREMATURE` as an 8-byte body-length sentinel). Wire framing for the
//! control channel — little-endian `{u16 command, u16 length, payload}` —
//! and the fd convention — stdin/stdout serve as the output/input pipes,
//! fd 3 as the control socket — are judgment calls recorded in
//! DESIGN.md, since the retrieval pack's header only names the command
//! set, not its byte layout or the child's fd numbering.

use crate::client::BackendClient;
use crate::request::{BackendRequest, BackendResponse};
use bp_core::{Address, CgiAddress, GatewayError};
use bytes::{BufMut, Bytes, BytesMut};
use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use monoio::net::UnixStream;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

const CMD_NOP: u16 = 0;
const CMD_REQUEST: u16 = 1;
const CMD_METHOD: u16 = 2;
const CMD_URI: u16 = 3;
const CMD_SCRIPT_NAME: u16 = 4;
const CMD_PATH_INFO: u16 = 5;
const CMD_QUERY_STRING: u16 = 6;
const CMD_HEADER: u16 = 7;
const CMD_PARAMETER: u16 = 8;
const CMD_STATUS: u16 = 9;
const CMD_NO_DATA: u16 = 10;
const CMD_DATA: u16 = 11;
const CMD_LENGTH: u16 = 12;
const CMD_STOP: u16 = 13;
const CMD_PREMATURE: u16 = 14;

const CONTROL_FD: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    RequestBodyActive,
    AwaitingStatus,
    Headers,
    Body,
    Done,
}

fn peer_failure(addr: &str, detail: impl std::fmt::Display) -> GatewayError {
    GatewayError::PeerFailure { addr: addr.to_string(), detail: detail.to_string() }
}

fn encode_packet(command: u16, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u16_le(command);
    buf.put_u16_le(payload.len() as u16);
    buf.extend_from_slice(payload);
    buf.freeze()
}

fn encode_name_value(name: &str, value: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(name.len() + 1 + value.len());
    buf.extend_from_slice(name.as_bytes());
    buf.push(b'=');
    buf.extend_from_slice(value.as_bytes());
    buf
}

fn decode_name_value(payload: &[u8]) -> Result<(String, String), GatewayError> {
    let pos = payload
        .iter()
        .position(|&b| b == b'=')
        .ok_or_else(|| GatewayError::ProtocolViolation("malformed WAS HEADER packet".into()))?;
    if pos == 0 {
        return Err(GatewayError::ProtocolViolation("malformed WAS HEADER packet".into()));
    }
    let name = String::from_utf8_lossy(&payload[..pos]).into_owned();
    let value = String::from_utf8_lossy(&payload[pos + 1..]).into_owned();
    Ok((name.to_lowercase(), value))
}

fn decode_status(payload: &[u8]) -> Result<u16, GatewayError> {
    match payload.len() {
        2 => Ok(u16::from_le_bytes([payload[0], payload[1]])),
        4 => {
            let v = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
            u16::try_from(v).map_err(|_| GatewayError::ProtocolViolation("malformed STATUS".into()))
        }
        _ => Err(GatewayError::ProtocolViolation("malformed STATUS".into())),
    }
}

fn decode_u64(payload: &[u8]) -> Result<u64, GatewayError> {
    if payload.len() != 8 {
        return Err(GatewayError::ProtocolViolation("malformed LENGTH/PREMATURE packet".into()));
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(payload);
    Ok(u64::from_le_bytes(bytes))
}

struct SpawnedWas {
    control: UnixStream,
    input: UnixStream,
    output: UnixStream,
    state: ClientState,
}

/// Lazily spawns its WAS application process on the first request, like
/// `HttpClient`/`AjpClient` lazily connect — the address (and thus the
/// executable to run) is only known once a request arrives.
pub struct WasClient {
    spawned: Option<SpawnedWas>,
}

impl WasClient {
    pub fn new() -> Self {
        WasClient { spawned: None }
    }

    fn cgi_address(address: &Address) -> Result<(&str, &CgiAddress), GatewayError> {
        match address {
            Address::Was { executable_path, cgi } => Ok((executable_path.as_str(), cgi)),
            _ => Err(GatewayError::Internal("was client given non-WAS address".into())),
        }
    }

    /// Spawns the WAS application, wiring stdin/stdout as the
    /// output/input pipes and fd 3 as the control socket, per this
    /// module's documented fd convention.
    fn spawn(executable_path: &str, cgi: &CgiAddress) -> Result<SpawnedWas, GatewayError> {
        let (control_parent, control_child) =
            StdUnixStream::pair().map_err(|e| peer_failure(executable_path, e))?;

        let mut command = Command::new(executable_path);
        command.args(&cgi.args);
        command.stdin(Stdio::piped());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::inherit());
        for (name, value) in &cgi.env {
            command.env(name, value);
        }

        let control_child_fd = control_child.as_raw_fd();
        unsafe {
            command.pre_exec(move || {
                let dup = libc::dup2(control_child_fd, CONTROL_FD);
                if dup < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = command.spawn().map_err(|e| peer_failure(executable_path, e))?;
        drop(control_child);

        let stdin = child.stdin.take().ok_or_else(|| GatewayError::Internal("no child stdin".into()))?;
        let stdout = child.stdout.take().ok_or_else(|| GatewayError::Internal("no child stdout".into()))?;

        let output_std = unsafe { StdUnixStream::from_raw_fd(stdin.into_raw_fd()) };
        let input_std = unsafe { StdUnixStream::from_raw_fd(stdout.into_raw_fd()) };

        let control = UnixStream::from_std(control_parent).map_err(|e| peer_failure(executable_path, e))?;
        let input = UnixStream::from_std(input_std).map_err(|e| peer_failure(executable_path, e))?;
        let output = UnixStream::from_std(output_std).map_err(|e| peer_failure(executable_path, e))?;

        // Intentionally leak the `Child` handle: this port doesn't reap
        // long-lived WAS worker processes here, matching `concurrency`'s
        // pooled-worker model rather than per-request fork+exec.
        std::mem::forget(child);

        Ok(SpawnedWas { control, input, output, state: ClientState::RequestBodyActive })
    }
}

impl SpawnedWas {
    async fn send_control(&mut self, command: u16, payload: &[u8]) -> Result<(), GatewayError> {
        let packet = encode_packet(command, payload);
        let (res, _) = self.control.write_all(packet.to_vec()).await;
        res.map_err(|e| peer_failure("was", e))
    }

    async fn read_control_packet(&mut self) -> Result<(u16, Bytes), GatewayError> {
        let header = vec![0u8; 4];
        let (res, header) = self.control.read(header).await;
        let n = res.map_err(|e| peer_failure("was", e))?;
        if n < 4 {
            return Err(peer_failure("was", "short control packet header"));
        }
        let command = u16::from_le_bytes([header[0], header[1]]);
        let len = u16::from_le_bytes([header[2], header[3]]) as usize;

        let mut acc = Vec::with_capacity(len);
        while acc.len() < len {
            let scratch = vec![0u8; len - acc.len()];
            let (res, scratch) = self.control.read(scratch).await;
            let n = res.map_err(|e| peer_failure("was", e))?;
            if n == 0 {
                return Err(peer_failure("was", "control channel closed mid-packet"));
            }
            acc.extend_from_slice(&scratch[..n]);
        }
        Ok((command, Bytes::from(acc)))
    }

    async fn send_request_body(&mut self, body: &Option<Bytes>) -> Result<(), GatewayError> {
        match body {
            None => {
                self.send_control(CMD_NO_DATA, &[]).await?;
            }
            Some(bytes) if bytes.is_empty() => {
                self.send_control(CMD_NO_DATA, &[]).await?;
            }
            Some(bytes) => {
                self.send_control(CMD_DATA, &[]).await?;
                let (res, _) = self.output.write_all(bytes.to_vec()).await;
                res.map_err(|e| peer_failure("was", e))?;
                self.send_control(CMD_LENGTH, &(bytes.len() as u64).to_le_bytes()).await?;
            }
        }
        self.state = ClientState::AwaitingStatus;
        Ok(())
    }

    async fn read_response_body(&mut self, expected_len: u64) -> Result<Bytes, GatewayError> {
        let mut acc = Vec::with_capacity(expected_len as usize);
        while (acc.len() as u64) < expected_len {
            let remaining = (expected_len - acc.len() as u64) as usize;
            let scratch = vec![0u8; remaining.min(8192)];
            let (res, scratch) = self.input.read(scratch).await;
            let n = res.map_err(|e| peer_failure("was", e))?;
            if n == 0 {
                return Err(peer_failure("was", "input pipe closed before LENGTH reached"));
            }
            acc.extend_from_slice(&scratch[..n]);
        }
        Ok(Bytes::from(acc))
    }
}

impl BackendClient for WasClient {
    async fn send_request(&mut self, req: BackendRequest) -> Result<BackendResponse, GatewayError> {
        let (executable_path, cgi) = Self::cgi_address(&req.address)?;
        let executable_path = executable_path.to_string();
        let cgi = cgi.clone();

        if self.spawned.is_none() {
            self.spawned = Some(Self::spawn(&executable_path, &cgi)?);
        }
        let was = self.spawned.as_mut().expect("just spawned");

        was.send_control(CMD_REQUEST, &[]).await?;
        was.send_control(CMD_METHOD, &(req.method as u8 as u32).to_le_bytes()).await?;
        was.send_control(CMD_URI, req.path.as_bytes()).await?;
        if let Some(script_name) = &cgi.script_name {
            was.send_control(CMD_SCRIPT_NAME, script_name.as_bytes()).await?;
        }
        if let Some(path_info) = &cgi.path_info {
            was.send_control(CMD_PATH_INFO, path_info.as_bytes()).await?;
        }
        if let Some(query_string) = &cgi.query_string {
            was.send_control(CMD_QUERY_STRING, query_string.as_bytes()).await?;
        }
        for (name, value) in &req.headers {
            let payload = encode_name_value(name, value);
            was.send_control(CMD_HEADER, &payload).await?;
        }
        for (name, value) in &cgi.env {
            let payload = encode_name_value(name, value);
            was.send_control(CMD_PARAMETER, &payload).await?;
        }

        was.send_request_body(&req.body).await?;

        let mut status = 200u16;
        let mut headers = Vec::new();
        loop {
            let (command, payload) = was.read_control_packet().await?;
            match command {
                CMD_NOP => {}
                CMD_STATUS if was.state == ClientState::AwaitingStatus => {
                    status = decode_status(&payload)?;
                    was.state = ClientState::Headers;
                }
                CMD_HEADER if was.state == ClientState::Headers => {
                    headers.push(decode_name_value(&payload)?);
                }
                CMD_NO_DATA if was.state == ClientState::Headers => {
                    was.state = ClientState::Done;
                    return Ok(BackendResponse { status, headers, body: Bytes::new() });
                }
                CMD_DATA if was.state == ClientState::Headers => {
                    was.state = ClientState::Body;
                }
                CMD_LENGTH if was.state == ClientState::Body => {
                    let len = decode_u64(&payload)?;
                    let body = if BackendResponse::suppress_body(status) {
                        Bytes::new()
                    } else {
                        was.read_response_body(len).await?
                    };
                    was.state = ClientState::Done;
                    return Ok(BackendResponse { status, headers, body });
                }
                CMD_PREMATURE => {
                    // Spec's Open Question: PREMATURE may arrive before STOP's
                    // ack. Treat it as a clean-but-short response regardless
                    // of `was.state`.
                    let sent = decode_u64(&payload)?;
                    was.state = ClientState::Done;
                    let body = was.read_response_body(sent).await.unwrap_or_default();
                    return Ok(BackendResponse { status, headers, body });
                }
                CMD_STOP => {
                    was.send_control(CMD_PREMATURE, &0u64.to_le_bytes()).await?;
                }
                _ => {
                    return Err(GatewayError::ProtocolViolation(format!(
                        "unexpected WAS command {command} in state {:?}",
                        was.state
                    )))
                }
            }
        }
    }
}
