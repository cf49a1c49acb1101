//! Out-of-process cleanup of segments and records
//!
//! The first segment created by a process forks a watchdog holding the read
//! end of a pipe. The publisher reports every name it takes or hands over as
//! one line on that pipe:
//!
//! ```text
//! +s <segment>    -s <segment>    +f <record path>    -f <record path>
//! ```
//!
//! The write end closes however the publisher ends, including `SIGKILL`
//! and `abort()`. On end of file the watchdog removes what is still
//! registered: records first, then segments.

#[cfg(unix)]
mod imp {
    use std::collections::BTreeSet;
    use std::fs::{self, File};
    use std::io::{BufRead, BufReader, Write};
    use std::os::fd::{AsRawFd, OwnedFd};
    use std::sync::Mutex;

    use nix::fcntl::{fcntl, open, FcntlArg, FdFlag, OFlag};
    use nix::sys::mman::shm_unlink;
    use nix::sys::signal::{signal, SigHandler, Signal};
    use nix::sys::stat::Mode;
    use nix::unistd::{dup2, fork, getpid, pipe, ForkResult, Pid};
    use tracing::{debug, warn};

    use crate::shm::os_id;

    /// Signals a terminal or supervisor sends to the whole process group.
    const IGNORED: [Signal; 4] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP, Signal::SIGQUIT];

    enum State {
        Idle,
        Running(Agent),
        /// Spawning or writing failed in this process; auto-cleanup then
        /// relies on `Drop` alone.
        Unavailable(Pid),
    }

    struct Agent {
        /// Process the pipe belongs to; a forked child needs its own agent.
        owner: Pid,
        pid: Pid,
        pipe: File,
    }

    static AGENT: Mutex<State> = Mutex::new(State::Idle);

    pub fn send(op: char, kind: char, item: &str) {
        if item.contains('\n') {
            warn!(item, "name contains a newline, not tracked");
            return;
        }
        let Ok(mut state) = AGENT.lock() else {
            return;
        };
        let me = getpid();

        let stale = match &*state {
            State::Idle => true,
            State::Running(agent) => agent.owner != me,
            State::Unavailable(owner) => *owner != me,
        };
        if stale {
            // The inherited pipe is the parent's; closing our copy keeps it
            // from delaying the parent's cleanup.
            *state = State::Idle;
            if op == '-' {
                return;
            }
            *state = match spawn(me) {
                Ok(agent) => {
                    debug!(agent = %agent.pid, "cleanup agent started");
                    State::Running(agent)
                }
                Err(e) => {
                    warn!(error = %e, "cleanup agent unavailable");
                    State::Unavailable(me)
                }
            };
        }

        if let State::Running(agent) = &mut *state {
            let line = format!("{}{} {}\n", op, kind, item);
            if let Err(e) = agent.pipe.write_all(line.as_bytes()) {
                warn!(agent = %agent.pid, error = %e, "cleanup agent lost");
                *state = State::Unavailable(me);
            }
        }
    }

    fn spawn(owner: Pid) -> nix::Result<Agent> {
        let (read, write) = pipe()?;
        fcntl(write.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
        match unsafe { fork() }? {
            ForkResult::Child => {
                drop(write);
                watch(read)
            }
            ForkResult::Parent { child } => Ok(Agent {
                owner,
                pid: child,
                pipe: File::from(write),
            }),
        }
    }

    fn watch(read: OwnedFd) -> ! {
        for sig in IGNORED {
            let _ = unsafe { signal(sig, SigHandler::SigIgn) };
        }
        if let Ok(null) = open("/dev/null", OFlag::O_RDWR, Mode::empty()) {
            let _ = dup2(null, 0);
            let _ = dup2(null, 1);
            if null > 2 {
                let _ = nix::unistd::close(null);
            }
        }

        let mut segments = BTreeSet::new();
        let mut files = BTreeSet::new();
        for line in BufReader::new(File::from(read)).lines() {
            let Ok(line) = line else { break };
            let (Some(tag), Some(item)) = (line.get(..2), line.get(3..)) else {
                continue;
            };
            let item = item.to_string();
            match tag {
                "+s" => segments.insert(item),
                "-s" => segments.remove(&item),
                "+f" => files.insert(item),
                "-f" => files.remove(&item),
                _ => false,
            };
        }

        for path in &files {
            let _ = fs::remove_file(path);
        }
        for name in &segments {
            let _ = shm_unlink(os_id(name).as_str());
        }
        unsafe { nix::libc::_exit(0) }
    }
}

#[cfg(not(unix))]
mod imp {
    pub fn send(_op: char, _kind: char, _item: &str) {}
}

use std::path::Path;

/// Register a segment to be unlinked if this process dies holding it.
pub(crate) fn track_segment(name: &str) {
    imp::send('+', 's', name);
}

/// Cleanup of `name` is no longer this process's concern.
pub(crate) fn forget_segment(name: &str) {
    imp::send('-', 's', name);
}

pub(crate) fn track_file(path: &Path) {
    if let Some(path) = path.to_str() {
        imp::send('+', 'f', path);
    }
}

pub(crate) fn forget_file(path: &Path) {
    if let Some(path) = path.to_str() {
        imp::send('-', 'f', path);
    }
}
