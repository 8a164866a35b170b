use anyhow::bail;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tracing::warn;

/// Start the command in a process group of its own, led by the engine.
pub(crate) fn isolate(command: &mut tokio::process::Command) {
    command.process_group(0);
}

/// Kill the process group led by `pid`. Falls back to a process tree walk when the
/// group cannot be signalled. A group that no longer exists is already terminated.
pub(crate) fn terminate(pid: u32) -> anyhow::Result<()> {
    let Ok(raw) = i32::try_from(pid) else {
        bail!("pid {pid} does not fit a process group id");
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => {
            warn!(pid, "process group kill refused ({e}), killing process tree instead");
            super::kill_tree(pid).map(|_| ())
        }
    }
}
