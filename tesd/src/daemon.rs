//! Daemonization and privilege handling.
//!
//! SysV-style double fork: the original process stays in the foreground
//! waiting on a pipe until the daemon reports that it came up (or the
//! timeout passes), so a failed startup is visible in the exit code.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::time::Duration;

use nix::sys::stat::{umask, Mode};
use nix::unistd::{fork, setgid, setsid, setuid, ForkResult, Gid, Uid};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// The daemon's end of the readiness pipe. Dropping it without calling
/// [`ReadySignal::ok`] makes the waiting parent exit with failure.
pub struct ReadySignal {
    fd: OwnedFd,
}

impl ReadySignal {
    /// Report successful startup; the foreground parent exits 0.
    pub fn ok(self) {
        self.send(0);
    }

    pub fn fail(self) {
        self.send(1);
    }

    fn send(&self, status: u8) {
        let buf = [status];
        unsafe { libc::write(self.fd.as_raw_fd(), buf.as_ptr().cast(), 1) };
    }
}

fn make_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

/// Detach from the terminal. Returns in the daemon process only; the
/// caller must invoke [`ReadySignal::ok`] once the server is up.
pub fn daemonize(pidfile: Option<&Path>, timeout: Duration) -> io::Result<ReadySignal> {
    let (rd, wr) = make_pipe()?;

    match unsafe { fork() }? {
        ForkResult::Parent { .. } => {
            drop(wr);
            std::process::exit(wait_for_child(rd, timeout));
        }
        ForkResult::Child => {}
    }
    drop(rd);

    setsid()?;

    // second fork so the daemon can never reacquire a controlling
    // terminal; the intermediate parent just exits
    match unsafe { fork() }? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    umask(Mode::empty());
    std::env::set_current_dir("/")?;

    let devnull = std::fs::OpenOptions::new().read(true).write(true).open("/dev/null")?;
    for fd in 0..3 {
        if unsafe { libc::dup2(devnull.as_raw_fd(), fd) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }

    if let Some(pidfile) = pidfile {
        std::fs::write(pidfile, format!("{}\n", std::process::id()))?;
    }

    Ok(ReadySignal { fd: wr })
}

/// Block on the readiness pipe; returns the daemon's status byte, or 1
/// on timeout or a dropped pipe.
fn wait_for_child(rd: OwnedFd, timeout: Duration) -> i32 {
    let mut pfd = libc::pollfd { fd: rd.as_raw_fd(), events: libc::POLLIN, revents: 0 };
    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
    let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    if rc <= 0 {
        eprintln!("daemon did not initialize in time");
        return 1;
    }
    let mut status = [1u8];
    let n = unsafe { libc::read(rd.as_raw_fd(), status.as_mut_ptr().cast(), 1) };
    if n == 1 {
        status[0] as i32
    } else {
        1
    }
}

/// Drop to the given uid/gid; zero leaves the respective id alone. The
/// group goes first, while we can still change it.
pub fn drop_privileges(uid: u32, gid: u32) -> nix::Result<()> {
    if gid > 0 {
        setgid(Gid::from_raw(gid))?;
    }
    if uid > 0 {
        setuid(Uid::from_raw(uid))?;
    }
    Ok(())
}
