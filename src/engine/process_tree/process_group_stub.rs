/// Process groups are a unix notion, nothing to set up here.
pub(crate) fn isolate(_command: &mut tokio::process::Command) {}

/// Kill the engine and all of its descendants.
pub(crate) fn terminate(pid: u32) -> anyhow::Result<()> {
    super::kill_tree(pid).map(|_| ())
}
