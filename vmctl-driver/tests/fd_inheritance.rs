//! Sockets named in `fd_connect` directives reach the child as fds 3, 4, ...

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::UnixListener;
use vmctl_core::{Instance, InstanceConfig, InstanceStatus, SnapshotTag};
use vmctl_driver::{DriverError, ImageBackend, LaunchConfig, QemuDriver};

struct NoImages;

#[async_trait]
impl ImageBackend for NoImages {
    async fn ensure_disk(&self, _: &LaunchConfig) -> Result<(), DriverError> {
        Ok(())
    }
    async fn save_snapshot(&self, _: &LaunchConfig, _: bool, _: &SnapshotTag) -> Result<(), DriverError> {
        Ok(())
    }
    async fn delete_snapshot(&self, _: &LaunchConfig, _: bool, _: &SnapshotTag) -> Result<(), DriverError> {
        Ok(())
    }
    async fn load_snapshot(&self, _: &LaunchConfig, _: bool, _: &SnapshotTag) -> Result<(), DriverError> {
        Ok(())
    }
    async fn list_snapshots(&self, _: &LaunchConfig, _: bool) -> Result<String, DriverError> {
        Ok(String::new())
    }
}

fn fd_connect(path: &Path) -> String {
    format!("{{{{ fd_connect \"{}\" }}}}", path.display())
}

fn driver(dir: &Path, args: Vec<String>) -> QemuDriver {
    let cmdline = move |_: &LaunchConfig| -> Result<(PathBuf, Vec<String>), DriverError> {
        Ok((PathBuf::from("/bin/sh"), args.clone()))
    };
    let instance = Instance::new("fds", dir.to_owned(), InstanceStatus::Stopped);
    QemuDriver::new(instance, InstanceConfig::default(), 0, Arc::new(cmdline), Arc::new(NoImages))
}

async fn read_all(listener: &UnixListener) -> String {
    let (mut stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("child must connect")
        .expect("accept");
    let mut out = String::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_string(&mut out))
        .await
        .expect("child must close the socket")
        .expect("read");
    out
}

#[tokio::test]
async fn templated_sockets_are_inherited_in_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let a = dir.path().join("a.sock");
    let b = dir.path().join("b.sock");
    let la = UnixListener::bind(&a).expect("bind a");
    let lb = UnixListener::bind(&b).expect("bind b");

    // $0 and $1 are the substituted descriptor numbers.
    let args = vec![
        "-c".to_owned(),
        r#"echo "first $0" >&$0; echo "second $0 $1" >&$1"#.to_owned(),
        fd_connect(&a),
        fd_connect(&b),
    ];
    let mut drv = driver(dir.path(), args);
    let signal = drv.start().await.expect("start");

    assert_eq!(read_all(&la).await, "first 3\n");
    assert_eq!(read_all(&lb).await, "second 3 4\n");

    let exit = tokio::time::timeout(Duration::from_secs(5), signal.recv())
        .await
        .expect("child exits");
    assert!(exit.is_ok(), "got {exit:?}");
}

#[tokio::test]
async fn unreachable_socket_aborts_start() {
    let dir = tempfile::tempdir().expect("tempdir");
    let args = vec![
        "-c".to_owned(),
        "exit 0".to_owned(),
        fd_connect(&dir.path().join("absent.sock")),
    ];
    let mut drv = driver(dir.path(), args);
    let res = drv.start().await;
    assert!(matches!(res, Err(DriverError::FdConnect { .. })), "got {res:?}");
    assert!(drv.process().is_none());
}

#[tokio::test]
async fn malformed_directive_aborts_start() {
    let dir = tempfile::tempdir().expect("tempdir");
    let args = vec!["-c".to_owned(), "exit 0".to_owned(), "{{ fd_connect }}".to_owned()];
    let mut drv = driver(dir.path(), args);
    assert!(matches!(drv.start().await, Err(DriverError::Template { .. })));
}
