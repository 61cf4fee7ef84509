//! Wire format
//!
//! Control frames in both directions are UTF-8 text terminated by EOT
//! (`0x04`). Client frames are JSON objects whose `req` field names the
//! request. Server frames are `OK`, `ERROR: <message>` or JSON.
//!
//! File payloads follow a `send` request as a big-endian `u64` length and
//! exactly that many bytes.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream,
};

use crate::config::ServerConfig;
use crate::core::filename;
use crate::core::models::{now_millis, FileType, Mode, Modification, ProjectId, Submission, SubmissionId};
use crate::error::{ProtocolError, SessionError};

pub const EOT: u8 = 0x04;
pub const OK: &str = "OK";
pub const ERROR_PREFIX: &str = "ERROR: ";

const REQUESTS: [&str; 6] = [
    "login",
    "register",
    "submission_new",
    "submission_continue",
    "send",
    "logout",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub password: String,
    pub mode: Mode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSubmission {
    pub project: ProjectId,
    /// Client creation time (ms)
    pub time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinueSubmission {
    pub submission: SubmissionId,
}

/// Metadata announced ahead of a payload. Older clients put everything
/// into `filename` using the legacy encoding instead.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SendFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<FileType>,
    #[serde(rename = "mod", default, skip_serializing_if = "Option::is_none")]
    pub modification: Option<Modification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<i64>,
    /// Client side numbering, informational only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<u64>,
}

/// Resolved description of an incoming file
#[derive(Debug, Clone, PartialEq)]
pub struct FileMeta {
    pub name: String,
    pub package: String,
    pub kind: FileType,
    pub modification: Modification,
    pub time: i64,
}

impl SendFile {
    pub fn resolve(&self) -> Result<FileMeta, ProtocolError> {
        if let Some(encoded) = &self.filename {
            let parsed = filename::parse(encoded).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
            return Ok(FileMeta {
                name: parsed.name,
                package: parsed.package,
                kind: parsed.kind,
                modification: parsed.modification,
                time: parsed.time,
            });
        }
        let name = self.name.clone().unwrap_or_default();
        let package = self.package.clone().unwrap_or_default();
        filename::check(&name, &package).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        Ok(FileMeta {
            kind: self.kind.unwrap_or_else(|| filename::classify(&name).0),
            package,
            modification: self.modification.unwrap_or_default(),
            time: self.time.unwrap_or_else(now_millis),
            name,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "req", rename_all = "snake_case")]
pub enum Request {
    Login(Credentials),
    Register(Credentials),
    SubmissionNew(NewSubmission),
    SubmissionContinue(ContinueSubmission),
    Send(SendFile),
    Logout,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Login(_) => "login",
            Request::Register(_) => "register",
            Request::SubmissionNew(_) => "submission_new",
            Request::SubmissionContinue(_) => "submission_continue",
            Request::Send(_) => "send",
            Request::Logout => "logout",
        }
    }

    /// Decode one control frame
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_slice(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let req = match value.get("req") {
            Some(Value::String(req)) => req.clone(),
            Some(other) => return Err(ProtocolError::UnknownRequest(other.to_string())),
            None => return Err(ProtocolError::MissingRequestType),
        };
        if !REQUESTS.contains(&req.as_str()) {
            return Err(ProtocolError::UnknownRequest(req));
        }
        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(format!("{}: {}", req, e)))
    }

    pub fn encode(&self) -> Vec<u8> {
        // Serializing plain data structs cannot fail
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Reply to `submission_continue`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinueReply {
    pub submission: Submission,
    pub file_count: u64,
}

/// Framed connection with per-read idle timeout and size limits
pub struct Connection<S> {
    stream: BufStream<S>,
    idle_timeout: Duration,
    max_frame: usize,
    max_payload: u64,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    pub fn new(stream: S, config: &ServerConfig) -> Self {
        Self {
            stream: BufStream::new(stream),
            idle_timeout: config.idle_timeout(),
            max_frame: config.max_frame_bytes,
            max_payload: config.max_payload_bytes,
        }
    }

    /// Next frame without its terminator
    pub async fn read_frame(&mut self) -> Result<Vec<u8>, SessionError> {
        let mut buf = Vec::new();
        let limit = self.max_frame as u64 + 1;
        let mut reader = (&mut self.stream).take(limit);
        let n = tokio::time::timeout(self.idle_timeout, reader.read_until(EOT, &mut buf))
            .await
            .map_err(|_| ProtocolError::IdleTimeout)??;

        if n == 0 {
            return Err(ProtocolError::ConnectionClosed.into());
        }
        if buf.last() != Some(&EOT) {
            return Err(if buf.len() > self.max_frame {
                ProtocolError::FrameTooLarge(self.max_frame)
            } else {
                ProtocolError::ConnectionClosed
            }
            .into());
        }
        buf.pop();
        Ok(buf)
    }

    pub async fn read_request(&mut self) -> Result<Request, SessionError> {
        let frame = self.read_frame().await?;
        Ok(Request::decode(&frame)?)
    }

    /// Length prefixed file payload
    pub async fn read_payload(&mut self) -> Result<Vec<u8>, SessionError> {
        let size = tokio::time::timeout(self.idle_timeout, self.stream.read_u64())
            .await
            .map_err(|_| ProtocolError::IdleTimeout)?
            .map_err(eof_as_closed)?;
        if size > self.max_payload {
            return Err(ProtocolError::PayloadTooLarge {
                size,
                limit: self.max_payload,
            }
            .into());
        }

        let mut data = vec![0u8; size as usize];
        tokio::time::timeout(self.idle_timeout, self.stream.read_exact(&mut data))
            .await
            .map_err(|_| ProtocolError::IdleTimeout)?
            .map_err(eof_as_closed)?;
        Ok(data)
    }

    pub async fn write_frame(&mut self, data: &[u8]) -> Result<(), SessionError> {
        self.stream.write_all(data).await?;
        self.stream.write_u8(EOT).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn write_ok(&mut self) -> Result<(), SessionError> {
        self.write_frame(OK.as_bytes()).await
    }

    pub async fn write_error(&mut self, message: &str) -> Result<(), SessionError> {
        self.write_frame(format!("{}{}", ERROR_PREFIX, message).as_bytes())
            .await
    }

    pub async fn write_json<T: Serialize>(&mut self, value: &T) -> Result<(), SessionError> {
        let data = serde_json::to_vec(value).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        self.write_frame(&data).await
    }

    pub async fn write_request(&mut self, request: &Request) -> Result<(), SessionError> {
        self.write_frame(&request.encode()).await
    }

    pub async fn write_payload(&mut self, data: &[u8]) -> Result<(), SessionError> {
        self.stream.write_u64(data.len() as u64).await?;
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), SessionError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

fn eof_as_closed(err: std::io::Error) -> SessionError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ProtocolError::ConnectionClosed.into()
    } else {
        err.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    fn config() -> ServerConfig {
        ServerConfig {
            max_frame_bytes: 64,
            max_payload_bytes: 16,
            ..ServerConfig::default()
        }
    }

    #[test]
    fn test_decode_requests() {
        let login = Request::decode(br#"{"req":"login","user":"ann","password":"pw","mode":"file_remote"}"#).unwrap();
        assert_eq!(
            login,
            Request::Login(Credentials {
                user: "ann".into(),
                password: "pw".into(),
                mode: Mode::FileRemote,
            })
        );
        assert_eq!(Request::decode(br#"{"req":"logout"}"#).unwrap(), Request::Logout);

        let send = Request::decode(br#"{"req":"send","name":"Main.java","package":"a.b","type":"src","mod":"c"}"#).unwrap();
        let Request::Send(meta) = send else {
            panic!("expected send");
        };
        let meta = meta.resolve().unwrap();
        assert_eq!(meta.kind, FileType::Source);
        assert_eq!(meta.modification, Modification::Saved);
        assert_eq!(meta.package, "a.b");
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            Request::decode(br#"{"req":"X"}"#),
            Err(ProtocolError::UnknownRequest(r)) if r == "X"
        ));
        assert!(matches!(
            Request::decode(br#"{"user":"ann"}"#),
            Err(ProtocolError::MissingRequestType)
        ));
        assert!(matches!(
            Request::decode(br#"{"req":"login","user":"ann"}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(Request::decode(b"not json"), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_legacy_filename_metadata() {
        let send = SendFile {
            filename: Some("za_ac_Main.java_3000000_4_l".into()),
            ..SendFile::default()
        };
        let meta = send.resolve().unwrap();
        assert_eq!(meta.name, "Main.java");
        assert_eq!(meta.package, "za.ac");
        assert_eq!(meta.time, 3);
        assert_eq!(meta.modification, Modification::Launched);

        let bad = SendFile {
            filename: Some("Main.java".into()),
            ..SendFile::default()
        };
        assert!(bad.resolve().is_err());
    }

    #[test]
    fn test_file_names_must_stay_in_place() {
        let escaping = SendFile {
            name: Some("../../../outside/Pwn.java".into()),
            kind: Some(FileType::Source),
            ..SendFile::default()
        };
        assert!(matches!(escaping.resolve(), Err(ProtocolError::Malformed(_))));

        let absolute = SendFile {
            name: Some("Pwn.java".into()),
            package: Some("a./tmp".into()),
            ..SendFile::default()
        };
        assert!(matches!(absolute.resolve(), Err(ProtocolError::Malformed(_))));

        let legacy = SendFile {
            filename: Some("a_..\\Pwn.java_3000000_4_l".into()),
            ..SendFile::default()
        };
        assert!(matches!(legacy.resolve(), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_encode_uses_req_tag() {
        let encoded = Request::SubmissionContinue(ContinueSubmission {
            submission: SubmissionId::new(),
        })
        .encode();
        let value: Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(value["req"], "submission_continue");
    }

    #[tokio::test]
    async fn test_reads_frames_and_payload() {
        let mock = Builder::new()
            .read(b"{\"req\":\"send\"}\x04")
            .read(&[0, 0, 0, 0, 0, 0, 0, 3])
            .read(b"abc")
            .write(b"OK\x04")
            .build();
        let mut conn = Connection::new(mock, &config());

        assert_eq!(conn.read_request().await.unwrap(), Request::Send(SendFile::default()));
        assert_eq!(conn.read_payload().await.unwrap(), b"abc");
        conn.write_ok().await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let mock = Builder::new().read(&[b'a'; 100]).build();
        let mut conn = Connection::new(mock, &config());
        assert!(matches!(
            conn.read_frame().await,
            Err(SessionError::Protocol(ProtocolError::FrameTooLarge(64)))
        ));
    }

    #[tokio::test]
    async fn test_oversized_payload_is_rejected() {
        let mock = Builder::new().read(&[0, 0, 0, 0, 0, 0, 1, 0]).build();
        let mut conn = Connection::new(mock, &config());
        assert!(matches!(
            conn.read_payload().await,
            Err(SessionError::Protocol(ProtocolError::PayloadTooLarge { size: 256, limit: 16 }))
        ));
    }

    #[tokio::test]
    async fn test_eof_is_connection_closed() {
        let mock = Builder::new().read(b"{\"req\":").build();
        let mut conn = Connection::new(mock, &config());
        assert!(matches!(
            conn.read_frame().await,
            Err(SessionError::Protocol(ProtocolError::ConnectionClosed))
        ));
    }

    #[tokio::test]
    async fn test_error_frame() {
        let mock = Builder::new().write(b"ERROR: nope\x04").build();
        let mut conn = Connection::new(mock, &config());
        conn.write_error("nope").await.unwrap();
    }
}
