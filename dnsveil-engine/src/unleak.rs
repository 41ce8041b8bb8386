//! Leak-guard helper supervision
//!
//! The proxy ships with a standalone firewall helper that blocks
//! outbound port-53 traffic on every interface except the tunnel. The
//! helper takes no arguments, runs until killed and removes its rules on
//! exit, so the one correctness requirement here is that it never
//! outlives the proxy.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::event::ProxyHooks;

#[cfg(windows)]
const HELPER_NAME: &str = "dnsunleak.exe";
#[cfg(not(windows))]
const HELPER_NAME: &str = "dnsunleak";

/// Helper executable location: next to the proxy binary
pub fn default_helper_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.join(HELPER_NAME)))
        .unwrap_or_else(|| PathBuf::from(HELPER_NAME))
}

/// Spawn the helper and supervise it until `shutdown` fires.
///
/// stdout and stderr lines are forwarded to the info hook, one frame per
/// line. On shutdown a single newline is written to the helper's stdin
/// as a cooperative exit request and the process is then killed;
/// failures of either mechanism are ignored as long as the child ends up
/// dead. Returns the child's PID.
pub async fn spawn(
    path: PathBuf,
    hooks: Arc<dyn ProxyHooks>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<Option<u32>> {
    let mut child = Command::new(&path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::LeakGuard(format!("{}: {}", path.display(), e)))?;

    let pid = child.id();

    if let Some(stdout) = child.stdout.take() {
        let hooks = hooks.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                hooks.on_info(&format!("dnsunleak: {}", line)).await;
            }
        });
    }

    if let Some(stderr) = child.stderr.take() {
        let hooks = hooks.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                hooks.on_info(&format!("dnsunleak: {}", line)).await;
            }
        });
    }

    let mut stdin = child.stdin.take();
    tokio::spawn(async move {
        let exited = tokio::select! {
            _ = shutdown.recv() => false,
            result = child.wait() => {
                if let Ok(status) = result {
                    hooks.on_info(&format!("dnsunleak exited: {}", status)).await;
                }
                true
            }
        };

        if !exited {
            hooks.on_info("Killing dnsunleak").await;
            if let Some(mut stdin) = stdin.take() {
                let _ = stdin.write_all(b"\n").await;
                let _ = stdin.flush().await;
            }
            let _ = child.kill().await;
        }
    });

    Ok(pid)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct InfoCollector {
        lines: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl ProxyHooks for InfoCollector {
        async fn on_info(&self, message: &str) {
            self.lines.lock().push(message.to_string());
        }
    }

    #[tokio::test]
    async fn test_missing_helper_reports_error() {
        let (tx, rx) = broadcast::channel(1);
        let hooks = Arc::new(InfoCollector {
            lines: Mutex::new(Vec::new()),
        });
        let result = spawn(PathBuf::from("/nonexistent/dnsunleak"), hooks, rx).await;
        assert!(matches!(result, Err(Error::LeakGuard(_))));
        drop(tx);
    }

    #[tokio::test]
    async fn test_forwards_output_lines() {
        let (tx, rx) = broadcast::channel(1);
        let hooks = Arc::new(InfoCollector {
            lines: Mutex::new(Vec::new()),
        });

        // `ls` exits on its own after printing; the supervisor should
        // forward each line prefixed with the helper name
        let _ = spawn(PathBuf::from("/bin/ls"), hooks.clone(), rx)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let lines = hooks.lines.lock();
        assert!(lines.iter().any(|l| l.starts_with("dnsunleak: ")));
        drop(tx);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_child_killed_on_shutdown() {
        let (tx, rx) = broadcast::channel(1);
        let hooks = Arc::new(InfoCollector {
            lines: Mutex::new(Vec::new()),
        });

        // cat blocks on stdin forever until killed
        let pid = spawn(PathBuf::from("/bin/cat"), hooks, rx)
            .await
            .unwrap()
            .expect("child pid");

        let proc_path = format!("/proc/{}", pid);
        assert!(std::path::Path::new(&proc_path).exists());

        tx.send(()).unwrap();

        // killed and reaped within a bounded grace period
        let mut alive = true;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if !std::path::Path::new(&proc_path).exists() {
                alive = false;
                break;
            }
        }
        assert!(!alive, "helper still running after shutdown");
    }
}
