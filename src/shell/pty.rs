//! PTY allocation, shell spawning, resize, and I/O callbacks.
//!
//! Uses the `nix` crate for POSIX PTY APIs. The PTY master fd is kept alive
//! for the process lifetime so write and resize operations can be performed
//! on it. A spawned [`PtyProcess`] runs three background tasks: an input
//! writer (mpsc → master), an output reader (master → data callback), and an
//! exit watcher (child wait → exit callback).
//!
//! Every operation except [`PtyProcess::spawn`] logs and swallows its
//! errors; a dead PTY surfaces through the exit callback, not through write
//! failures.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::process::Stdio;
use std::sync::Arc;

use nix::pty::{openpty, OpenptyResult, Winsize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Callback invoked with each chunk of PTY output, on the reader task.
pub type DataCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Callback invoked once with the child's exit code, on the watcher task.
pub type ExitCallback = Box<dyn FnOnce(i32) + Send>;

/// Spawn parameters for a PTY-backed shell.
pub struct PtySpawnOpts {
    /// Shell binary path.
    pub shell: String,
    /// Arguments passed to the shell verbatim.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: String,
    pub cols: u16,
    pub rows: u16,
    /// Extra environment merged into the inherited environment.
    pub env: HashMap<String, String>,
    /// Session id exported to the child as `TTYHUB_SESSION_ID`.
    pub session_id: String,
}

/// A live shell process attached to a PTY master.
pub struct PtyProcess {
    /// OS process ID of the shell (also its process group, via setsid).
    pub pid: u32,
    /// Master fd kept for resize ioctls.
    master: OwnedFd,
    input_tx: mpsc::Sender<Vec<u8>>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl PtyProcess {
    /// Allocate a PTY, fork the shell onto its slave side, and wire the I/O
    /// tasks. Fails synchronously if the PTY cannot be allocated or the
    /// shell cannot be spawned.
    pub fn spawn(
        opts: PtySpawnOpts,
        on_data: DataCallback,
        on_exit: ExitCallback,
    ) -> std::io::Result<Self> {
        let winsize = Winsize {
            ws_row: opts.rows,
            ws_col: opts.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let OpenptyResult { master, slave } = openpty(&winsize, None)
            .map_err(|e| std::io::Error::other(format!("openpty failed: {e}")))?;

        let slave_fd = slave.as_raw_fd();
        let mut cmd = Command::new(&opts.shell);
        cmd.args(&opts.args);
        cmd.current_dir(&opts.cwd).kill_on_drop(true);

        // The child's stdio is handled by pre_exec (dup2 to the PTY slave),
        // so tell tokio not to set up pipes.
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        cmd.envs(&opts.env);
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");
        cmd.env("TTYHUB_SESSION_ID", &opts.session_id);

        // SAFETY: all syscalls used here are async-signal-safe per POSIX.
        unsafe {
            cmd.pre_exec(move || {
                // New session: the child is the session leader
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                // Adopt the PTY slave as the controlling terminal
                if libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                libc::dup2(slave_fd, 0);
                libc::dup2(slave_fd, 1);
                libc::dup2(slave_fd, 2);
                if slave_fd > 2 {
                    libc::close(slave_fd);
                }
                Ok(())
            });
        }

        let mut child = cmd.spawn()?;
        drop(slave);
        let pid = child.id().unwrap_or(0);

        let master_raw: RawFd = master.as_raw_fd();

        // Dup the master: one fd for writing, one for reading, the original
        // kept for resize.
        let writer_fd: RawFd = unsafe { libc::dup(master_raw) };
        if writer_fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let reader_fd: RawFd = unsafe { libc::dup(master_raw) };
        if reader_fd < 0 {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::close(writer_fd);
            }
            return Err(err);
        }

        // SAFETY: we own these file descriptors via dup.
        let master_write =
            tokio::fs::File::from_std(unsafe { std::fs::File::from_raw_fd(writer_fd) });
        let master_read =
            tokio::fs::File::from_std(unsafe { std::fs::File::from_raw_fd(reader_fd) });

        let sid = opts.session_id;

        // Input writer task: mpsc → PTY master
        let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(64);
        let writer_task = tokio::spawn(async move {
            let mut writer = master_write;
            while let Some(data) = input_rx.recv().await {
                if writer.write_all(&data).await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
        });

        // Output reader task: PTY master → data callback
        let sid_out = sid.clone();
        let reader_task = tokio::spawn(async move {
            let mut reader = master_read;
            let mut tmp = [0u8; 4096];
            loop {
                match reader.read(&mut tmp).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => on_data(&tmp[..n]),
                }
            }
            debug!("Session {sid_out} PTY output closed");
        });

        // Exit watcher task: child wait → exit callback
        let exit_task = tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    warn!("Session {sid} wait error: {e}");
                    -1
                }
            };
            info!("Session {sid} shell exited with code {code}");
            on_exit(code);
        });

        Ok(Self {
            pid,
            master,
            input_tx,
            tasks: vec![writer_task, reader_task, exit_task],
        })
    }

    /// Queue bytes for the shell's input. Errors are logged and swallowed;
    /// a closed channel means the shell already exited.
    pub async fn write(&self, data: Vec<u8>) {
        if self.input_tx.send(data).await.is_err() {
            debug!("PTY input channel closed (pid {})", self.pid);
        }
    }

    /// Resize the terminal window. Errors are logged and swallowed.
    pub fn resize(&self, cols: u16, rows: u16) {
        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: TIOCSWINSZ is a well-defined ioctl that reads a Winsize.
        let ret = unsafe {
            libc::ioctl(
                self.master.as_raw_fd(),
                libc::TIOCSWINSZ,
                std::ptr::addr_of!(winsize),
            )
        };
        if ret == -1 {
            warn!(
                "PTY resize to {cols}x{rows} failed (pid {}): {}",
                self.pid,
                std::io::Error::last_os_error()
            );
        }
    }

    /// Kill the shell's whole process group and stop the I/O tasks.
    ///
    /// The child is a session leader (setsid), so its pgid equals its pid
    /// and `kill(-pid, ...)` reaches the entire process tree.
    pub fn kill(&self) {
        #[allow(clippy::cast_possible_wrap)]
        let pgid = self.pid as i32;
        if pgid > 0 {
            let ret = unsafe { libc::kill(-pgid, libc::SIGKILL) };
            if ret == -1 {
                debug!(
                    "kill(-{pgid}, SIGKILL) failed: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
        for task in &self.tasks {
            task.abort();
        }
    }
}
