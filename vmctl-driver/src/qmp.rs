//! QEMU Machine Protocol client over the instance's control socket.
//!
//! A [`QmpSession`] lives for one exchange: connect, negotiate capabilities,
//! issue commands, drop. Sessions are never pooled; dropping one closes the
//! socket on every path.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use uuid::Uuid;

use crate::DriverError;

/// Poll until `path` exists.
///
/// # Errors
/// Returns [`DriverError::SocketTimeout`] once `timeout` has passed, or
/// [`DriverError::Io`] for any error other than "not found".
pub async fn wait_for_socket(
    path: &Path,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<(), DriverError> {
    let started = Instant::now();
    loop {
        match tokio::fs::metadata(path).await {
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if started.elapsed() > timeout {
            return Err(DriverError::SocketTimeout {
                path: path.to_owned(),
                waited: timeout,
            });
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// One open control-protocol connection.
#[derive(Debug)]
pub struct QmpSession {
    path: PathBuf,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    timeout: Duration,
}

impl QmpSession {
    /// Connect to the control socket and complete the capabilities handshake.
    ///
    /// `timeout` bounds the connect and each subsequent exchange.
    ///
    /// # Errors
    /// Returns [`DriverError::QmpConnect`] if the socket is missing, refuses
    /// the connection or does not accept within `timeout`, and
    /// [`DriverError::Qmp`] if the handshake fails.
    pub async fn connect(path: &Path, timeout: Duration) -> Result<Self, DriverError> {
        let connect_err = |source| DriverError::QmpConnect {
            path: path.to_owned(),
            source,
        };
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| connect_err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")))?
            .map_err(connect_err)?;

        let (read_half, writer) = stream.into_split();
        let mut session = Self {
            path: path.to_owned(),
            reader: BufReader::new(read_half),
            writer,
            timeout,
        };

        let greeting = tokio::time::timeout(timeout, session.read_message())
            .await
            .map_err(|_| DriverError::Qmp(format!("no greeting from {} within {timeout:?}", path.display())))??;
        if greeting.get("QMP").is_none() {
            return Err(DriverError::Qmp(format!(
                "unexpected greeting from {}: {greeting}",
                path.display()
            )));
        }
        session.execute("qmp_capabilities", None).await?;
        tracing::debug!(socket = %path.display(), "QMP session established");
        Ok(session)
    }

    /// Run one command and return its `return` payload.
    ///
    /// Asynchronous events received while waiting are skipped. The session
    /// timeout bounds the whole exchange, not each message.
    ///
    /// # Errors
    /// Returns [`DriverError::QmpCommand`] if the emulator answers with an
    /// error and [`DriverError::Qmp`] on I/O, timeout or framing problems.
    pub async fn execute(
        &mut self,
        command: &str,
        arguments: Option<Value>,
    ) -> Result<Value, DriverError> {
        let timeout = self.timeout;
        tokio::time::timeout(timeout, self.exchange(command, arguments))
            .await
            .map_err(|_| DriverError::Qmp(format!("{command} did not complete within {timeout:?}")))?
    }

    async fn exchange(&mut self, command: &str, arguments: Option<Value>) -> Result<Value, DriverError> {
        let id = Uuid::new_v4().to_string();
        let mut request = json!({ "execute": command, "id": id });
        if let Some(arguments) = arguments {
            request["arguments"] = arguments;
        }
        let mut line = request.to_string();
        line.push('\n');

        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| DriverError::Qmp(format!("send {command}: {e}")))?;

        loop {
            let message = self.read_message().await?;
            if let Some(event) = message.get("event") {
                tracing::debug!(socket = %self.path.display(), %event, "QMP event");
                continue;
            }
            if let Some(reply_id) = message.get("id") {
                if reply_id.as_str() != Some(id.as_str()) {
                    continue;
                }
            }
            if let Some(ret) = message.get("return") {
                return Ok(ret.clone());
            }
            if let Some(err) = message.get("error") {
                let field = |k: &str| err.get(k).and_then(Value::as_str).unwrap_or_default().to_owned();
                return Err(DriverError::QmpCommand {
                    command: command.to_owned(),
                    class: field("class"),
                    desc: field("desc"),
                });
            }
            tracing::debug!(%message, "ignoring unrecognised QMP message");
        }
    }

    /// Ask the guest to power down (ACPI). Only the acknowledgement is awaited.
    ///
    /// # Errors
    /// See [`QmpSession::execute`].
    pub async fn system_powerdown(&mut self) -> Result<(), DriverError> {
        self.execute("system_powerdown", None).await.map(drop)
    }

    /// Return the display server's service (port) string.
    ///
    /// # Errors
    /// Returns [`DriverError::Qmp`] if the reply carries no service.
    pub async fn query_vnc_service(&mut self) -> Result<String, DriverError> {
        let info = self.execute("query-vnc", None).await?;
        info.get("service")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| DriverError::Qmp(format!("query-vnc returned no service: {info}")))
    }

    /// Set the display server password.
    ///
    /// # Errors
    /// See [`QmpSession::execute`].
    pub async fn change_vnc_password(&mut self, password: &str) -> Result<(), DriverError> {
        self.execute("change-vnc-password", Some(json!({ "password": password })))
            .await
            .map(drop)
    }

    /// Close the connection.
    pub async fn disconnect(mut self) {
        if let Err(e) = self.writer.shutdown().await {
            tracing::debug!(socket = %self.path.display(), error = %e, "QMP shutdown");
        }
    }

    async fn read_message(&mut self) -> Result<Value, DriverError> {
        let mut line = String::new();
        let read = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(|e| DriverError::Qmp(format!("read from {}: {e}", self.path.display())))?;
        if read == 0 {
            return Err(DriverError::Qmp(format!(
                "{} closed the connection",
                self.path.display()
            )));
        }
        serde_json::from_str(&line).map_err(|e| DriverError::Qmp(format!("malformed message: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::UnixListener;
    use tokio::sync::mpsc;

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(2);
    const GREETING: &str = r#"{"QMP":{"version":{"qemu":{"major":8,"minor":2,"micro":0}},"capabilities":[]}}"#;

    /// Serve one connection, answering each command with `reply(command)` and
    /// reporting the command names seen.
    fn serve(
        listener: UnixListener,
        reply: fn(&str) -> Value,
    ) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let Ok((stream, _)) = listener.accept().await else { return };
            let (r, mut w) = stream.into_split();
            let _ = w.write_all(format!("{GREETING}\n").as_bytes()).await;
            let mut lines = BufReader::new(r).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Ok(req) = serde_json::from_str::<Value>(&line) else { break };
                let cmd = req["execute"].as_str().unwrap_or_default().to_owned();
                let mut resp = reply(&cmd);
                resp["id"] = req["id"].clone();
                let _ = w.write_all(format!("{resp}\n").as_bytes()).await;
                let _ = tx.send(cmd);
            }
        });
        rx
    }

    fn ok_reply(cmd: &str) -> Value {
        match cmd {
            "query-vnc" => json!({"return": {"enabled": true, "host": "127.0.0.1", "service": "5901"}}),
            _ => json!({"return": {}}),
        }
    }

    fn bind(dir: &Path) -> (PathBuf, UnixListener) {
        let path = dir.join("qmp.sock");
        match UnixListener::bind(&path) {
            Ok(l) => (path, l),
            Err(e) => panic!("bind {}: {e}", path.display()),
        }
    }

    fn tempdir() -> tempfile::TempDir {
        match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir: {e}"),
        }
    }

    #[tokio::test]
    async fn powerdown_negotiates_capabilities_first() {
        let dir = tempdir();
        let (path, listener) = bind(dir.path());
        let mut seen = serve(listener, ok_reply);

        let mut session = match QmpSession::connect(&path, TIMEOUT).await {
            Ok(s) => s,
            Err(e) => panic!("connect: {e}"),
        };
        assert!(session.system_powerdown().await.is_ok());
        session.disconnect().await;

        assert_eq!(seen.recv().await.as_deref(), Some("qmp_capabilities"));
        assert_eq!(seen.recv().await.as_deref(), Some("system_powerdown"));
    }

    #[tokio::test]
    async fn query_vnc_returns_service() {
        let dir = tempdir();
        let (path, listener) = bind(dir.path());
        let _seen = serve(listener, ok_reply);

        let mut session = match QmpSession::connect(&path, TIMEOUT).await {
            Ok(s) => s,
            Err(e) => panic!("connect: {e}"),
        };
        let service = session.query_vnc_service().await;
        assert_eq!(service.ok().as_deref(), Some("5901"));
    }

    #[tokio::test]
    async fn error_reply_becomes_command_error() {
        fn reject_password(cmd: &str) -> Value {
            if cmd == "change-vnc-password" {
                json!({"error": {"class": "GenericError", "desc": "Could not set password"}})
            } else {
                json!({"return": {}})
            }
        }
        let dir = tempdir();
        let (path, listener) = bind(dir.path());
        let _seen = serve(listener, reject_password);

        let mut session = match QmpSession::connect(&path, TIMEOUT).await {
            Ok(s) => s,
            Err(e) => panic!("connect: {e}"),
        };
        let res = session.change_vnc_password("hunter2").await;
        match res {
            Err(DriverError::QmpCommand { command, class, desc }) => {
                assert_eq!(command, "change-vnc-password");
                assert_eq!(class, "GenericError");
                assert_eq!(desc, "Could not set password");
            }
            other => panic!("expected QmpCommand error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn events_are_skipped_while_waiting_for_reply() {
        let dir = tempdir();
        let (path, listener) = bind(dir.path());
        tokio::spawn(async move {
            let Ok((stream, _)) = listener.accept().await else { return };
            let (r, mut w) = stream.into_split();
            let _ = w.write_all(format!("{GREETING}\n").as_bytes()).await;
            let mut lines = BufReader::new(r).lines();
            while let Ok(Some(_)) = lines.next_line().await {
                let _ = w
                    .write_all(b"{\"event\":\"POWERDOWN\",\"timestamp\":{\"seconds\":1,\"microseconds\":0}}\n")
                    .await;
                let _ = w.write_all(b"{\"return\":{}}\n").await;
            }
        });

        let mut session = match QmpSession::connect(&path, TIMEOUT).await {
            Ok(s) => s,
            Err(e) => panic!("connect: {e}"),
        };
        assert!(session.system_powerdown().await.is_ok());
    }

    #[tokio::test]
    async fn endless_events_hit_the_exchange_deadline() {
        let dir = tempdir();
        let (path, listener) = bind(dir.path());
        tokio::spawn(async move {
            let Ok((stream, _)) = listener.accept().await else { return };
            let (r, mut w) = stream.into_split();
            let _ = w.write_all(format!("{GREETING}\n").as_bytes()).await;
            let mut lines = BufReader::new(r).lines();
            // Answer the handshake, then only ever send events and foreign replies.
            if let Ok(Some(line)) = lines.next_line().await {
                let Ok(req) = serde_json::from_str::<Value>(&line) else { return };
                let resp = json!({"return": {}, "id": req["id"].clone()});
                let _ = w.write_all(format!("{resp}\n").as_bytes()).await;
            }
            let _ = lines.next_line().await;
            loop {
                let chatter = "{\"event\":\"RTC_CHANGE\"}\n{\"return\":{},\"id\":\"someone-else\"}\n";
                if w.write_all(chatter.as_bytes()).await.is_err() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });

        let timeout = Duration::from_millis(300);
        let mut session = match QmpSession::connect(&path, timeout).await {
            Ok(s) => s,
            Err(e) => panic!("connect: {e}"),
        };
        let started = Instant::now();
        let res = session.system_powerdown().await;
        assert!(matches!(res, Err(DriverError::Qmp(_))), "got {res:?}");
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "deadline must cover the whole exchange, took {:?}",
            started.elapsed()
        );
    }

    #[tokio::test]
    async fn missing_socket_is_connect_error() {
        let dir = tempdir();
        let res = QmpSession::connect(&dir.path().join("qmp.sock"), TIMEOUT).await;
        assert!(matches!(res, Err(DriverError::QmpConnect { .. })), "got {res:?}");
    }

    #[tokio::test]
    async fn bad_greeting_is_protocol_error() {
        let dir = tempdir();
        let (path, listener) = bind(dir.path());
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let _ = stream.write_all(b"{\"hello\":1}\n").await;
            }
        });
        let res = QmpSession::connect(&path, TIMEOUT).await;
        assert!(matches!(res, Err(DriverError::Qmp(_))), "got {res:?}");
    }

    #[tokio::test]
    async fn wait_for_socket_times_out() {
        let dir = tempdir();
        let path = dir.path().join("qmp.sock");
        let res = wait_for_socket(&path, Duration::from_millis(100), Duration::from_millis(20)).await;
        assert!(matches!(res, Err(DriverError::SocketTimeout { .. })), "got {res:?}");
    }

    #[tokio::test]
    async fn wait_for_socket_sees_late_file() {
        let dir = tempdir();
        let path = dir.path().join("qmp.sock");
        let late = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            let _ = tokio::fs::write(&late, b"").await;
        });
        let res = wait_for_socket(&path, Duration::from_secs(2), Duration::from_millis(20)).await;
        assert!(res.is_ok(), "got {res:?}");
    }
}
