#[cfg(unix)]
mod process_group;

#[cfg(unix)]
pub(crate) use process_group::*;

#[cfg(not(unix))]
mod process_group_stub;

#[cfg(not(unix))]
pub(crate) use process_group_stub::*;

use anyhow::bail;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{trace, warn};

/// Kill `root` and every process descending from it, children first.
///
/// Returns how many processes were signalled. Processes that vanish while the tree is
/// being walked are not an error.
pub(crate) fn kill_tree(root: u32) -> anyhow::Result<usize> {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);

    let mut tree = vec![Pid::from_u32(root)];
    let mut next = 0;
    while next < tree.len() {
        let parent = tree[next];
        let children = sys
            .processes()
            .iter()
            .filter(|(pid, process)| process.parent() == Some(parent) && !tree.contains(pid))
            .map(|(pid, _)| *pid)
            .collect::<Vec<_>>();
        tree.extend(children);
        next += 1;
    }
    trace!(root, tree = ?tree, "process tree");

    let mut killed = 0;
    let mut refused = vec![];
    for pid in tree.iter().rev() {
        let Some(process) = sys.process(*pid) else {
            continue;
        };
        if process.kill() {
            killed += 1;
        } else {
            warn!(%pid, "could not kill process");
            refused.push(*pid);
        }
    }

    if !refused.is_empty() {
        bail!("could not kill {} process(es) of tree {root}: {refused:?}", refused.len());
    }
    Ok(killed)
}
