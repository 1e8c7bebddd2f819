//! Listener handoff to a replacement process.
//!
//! The replacement is this same program, started with the same arguments,
//! the generation marker set, and the listening socket at fd 3. The parent
//! does not wait for the child: once `spawn` returns, the dispatcher drains
//! the current generation. Both processes hold the socket until the parent
//! exits, so the kernel keeps queueing connections throughout.

use std::ffi::OsString;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::process::Stdio;

use tokio::process::Command;

use crate::net::listener::{GENERATION_MARKER, INHERITED_FD};

/// Everything needed to start the next generation.
#[derive(Debug)]
pub struct ChildSpec {
    /// `argv[0]` of the current process.
    pub program: OsString,
    /// `argv[1..]` of the current process.
    pub args: Vec<OsString>,
    /// Variables set on top of the inherited environment.
    pub envs: Vec<(OsString, OsString)>,
    /// The listening socket, placed at [`INHERITED_FD`] in the child.
    pub inherited: OwnedFd,
}

impl ChildSpec {
    /// Describe a copy of the running process that inherits `listener`.
    pub fn for_current_process(listener: OwnedFd) -> io::Result<Self> {
        Self::from_argv(std::env::args_os(), listener)
    }

    /// Describe a child running `argv` that inherits `listener`.
    pub fn from_argv<I>(argv: I, listener: OwnedFd) -> io::Result<Self>
    where
        I: IntoIterator<Item = OsString>,
    {
        let mut argv = argv.into_iter();
        let program = argv
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "argv[0] is empty"))?;

        Ok(Self {
            program,
            args: argv.collect(),
            envs: vec![(GENERATION_MARKER.into(), "true".into())],
            inherited: listener,
        })
    }
}

/// Starts the next generation.
///
/// Implementations must return as soon as the child exists; they must not
/// wait for it to become ready.
pub trait Spawner: Send + Sync {
    /// Start the child and return its process id.
    fn spawn(&self, spec: ChildSpec) -> io::Result<u32>;
}

/// Spawns a real OS process.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessSpawner;

impl Spawner for ProcessSpawner {
    fn spawn(&self, spec: ChildSpec) -> io::Result<u32> {
        let ChildSpec {
            program,
            args,
            envs,
            inherited,
        } = spec;

        let mut command = Command::new(&program);
        command
            .args(&args)
            .envs(envs)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        let source = inherited.as_raw_fd();
        // SAFETY: the closure runs between fork and exec and only calls the
        // async-signal-safe dup2 and fcntl.
        unsafe {
            command.pre_exec(move || place_descriptor(source, INHERITED_FD));
        }

        let child = command.spawn()?;
        let pid = child.id().unwrap_or_default();
        tracing::info!(
            child_pid = pid,
            program = ?program,
            args = ?args,
            fd = INHERITED_FD,
            "Spawned replacement process"
        );

        // Dropping the handle neither kills nor waits for the child. The
        // parent's duplicate of the socket closes with `inherited`.
        drop(child);
        drop(inherited);
        Ok(pid)
    }
}

/// Put `source` at `target` without `FD_CLOEXEC`.
fn place_descriptor(source: RawFd, target: RawFd) -> io::Result<()> {
    if source == target {
        // dup2 onto itself is a no-op that would leave FD_CLOEXEC set.
        let flags = unsafe { libc::fcntl(target, libc::F_GETFD) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(target, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
            return Err(io::Error::last_os_error());
        }
    } else if unsafe { libc::dup2(source, target) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
