//! Wire clients for the other daemons of the fabric.
//!
//! Every peer speaks the same framed-JSON protocol: a frame is the payload
//! length in ASCII, a newline, then that many bytes of JSON. Requests are
//! `{action, token?, body}` maps; responses are `{code, body}` with a
//! non-zero code signalling an error. An empty frame means end-of-stream.

pub mod poller;
pub mod secrets;
pub mod slave;

pub use poller::PollerClient;
pub use secrets::SecretsClient;
pub use slave::{BuildStream, SlaveClient};

use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::error::{BellowsError, Result};

/// A framed connection to a peer daemon.
pub struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Connection {
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    /// Writes one frame.
    pub async fn send(&mut self, payload: &Value) -> Result<()> {
        let data = serde_json::to_vec(payload)?;
        let mut frame = format!("{}\n", data.len()).into_bytes();
        frame.extend_from_slice(&data);
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn send_with_timeout(
        &mut self,
        payload: &Value,
        timeout: Option<Duration>,
    ) -> Result<()> {
        match timeout {
            Some(duration) => tokio::time::timeout(duration, self.send(payload))
                .await
                .map_err(|_| BellowsError::Timeout("write to peer timed out".to_string()))?,
            None => self.send(payload).await,
        }
    }

    /// Reads one frame as raw text. Returns an empty string on an empty
    /// frame or a closed connection.
    pub async fn recv_raw(&mut self) -> Result<String> {
        let mut len_line = Vec::new();
        loop {
            let byte = match self.reader.read_u8().await {
                Ok(b) => b,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(String::new())
                }
                Err(e) => return Err(e.into()),
            };
            if byte == b'\n' {
                break;
            }
            len_line.push(byte);
        }

        let len_str = String::from_utf8_lossy(&len_line);
        let len: usize = len_str
            .trim()
            .parse()
            .map_err(|_| BellowsError::Client(format!("bad frame length {:?}", len_str)))?;
        if len == 0 {
            return Ok(String::new());
        }

        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf).await?;
        String::from_utf8(buf)
            .map_err(|e| BellowsError::Client(format!("frame is not utf-8: {}", e)))
    }

    /// Reads one response frame. Returns `None` on an empty frame; a
    /// non-zero response code becomes an error.
    pub async fn recv(&mut self) -> Result<Option<Value>> {
        let raw = self.recv_raw().await?;
        if raw.is_empty() {
            return Ok(None);
        }

        let value: Value = serde_json::from_str(&raw)?;
        if let Some(code) = value.get("code").and_then(code_as_i64) {
            if code != 0 {
                let error = value
                    .get("body")
                    .and_then(|b| b.get("error"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error from peer");
                return Err(BellowsError::Client(error.to_string()));
            }
        }
        Ok(Some(value))
    }

    pub async fn recv_with_timeout(&mut self, timeout: Option<Duration>) -> Result<Option<Value>> {
        match timeout {
            Some(duration) => tokio::time::timeout(duration, self.recv())
                .await
                .map_err(|_| BellowsError::Timeout("read from peer timed out".to_string()))?,
            None => self.recv().await,
        }
    }

    /// One-shot request helper: sends `{action, token, body}` and returns
    /// the response body.
    pub async fn request2server(
        &mut self,
        action: &str,
        body: Value,
        token: &str,
    ) -> Result<Value> {
        self.send(&json!({"action": action, "token": token, "body": body}))
            .await?;
        let response = self
            .recv()
            .await?
            .ok_or_else(|| BellowsError::Client(format!("empty response to {}", action)))?;
        Ok(response.get("body").cloned().unwrap_or(Value::Null))
    }
}

/// Peers send the response code either as a number or as a string.
fn code_as_i64(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn frame_server(frames: Vec<String>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            for frame in frames {
                let msg = format!("{}\n{}", frame.len(), frame);
                socket.write_all(msg.as_bytes()).await.unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_recv_parses_frames_in_order() {
        let addr = frame_server(vec![
            r#"{"code": 0, "body": {"n": 1}}"#.to_string(),
            r#"{"code": 0, "body": {"n": 2}}"#.to_string(),
        ])
        .await;

        let mut conn = Connection::connect("127.0.0.1", addr.port()).await.unwrap();
        let first = conn.recv().await.unwrap().unwrap();
        assert_eq!(first["body"]["n"], 1);
        let second = conn.recv().await.unwrap().unwrap();
        assert_eq!(second["body"]["n"], 2);
        // Server closed the connection: end of stream.
        assert!(conn.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recv_error_code() {
        let addr = frame_server(vec![
            r#"{"code": 1, "body": {"error": "bad token"}}"#.to_string()
        ])
        .await;

        let mut conn = Connection::connect("127.0.0.1", addr.port()).await.unwrap();
        let err = conn.recv().await.unwrap_err();
        assert!(matches!(err, BellowsError::Client(_)));
    }

    #[tokio::test]
    async fn test_recv_raw_empty_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"0\n").await.unwrap();
        });

        let mut conn = Connection::connect("127.0.0.1", addr.port()).await.unwrap();
        assert_eq!(conn.recv_raw().await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_send_frames_payload() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(socket);
            let mut line = String::new();
            tokio::io::AsyncBufReadExt::read_line(&mut reader, &mut line)
                .await
                .unwrap();
            let len: usize = line.trim().parse().unwrap();
            let mut buf = vec![0u8; len];
            reader.read_exact(&mut buf).await.unwrap();
            serde_json::from_slice::<Value>(&buf).unwrap()
        });

        let mut conn = Connection::connect("127.0.0.1", addr.port()).await.unwrap();
        conn.send(&json!({"action": "healthcheck"})).await.unwrap();

        let received = server.await.unwrap();
        assert_eq!(received["action"], "healthcheck");
    }
}
