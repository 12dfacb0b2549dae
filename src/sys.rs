//! Small OS helpers shared by the event store and the vault.

use std::path::Path;

/// Free bytes available to unprivileged writers on the filesystem holding
/// `path`. Walks up to the nearest existing ancestor so the check works
/// before the target directory has been created.
pub fn free_space_bytes(path: &Path) -> std::io::Result<u64> {
    let mut probe = path;
    while !probe.exists() {
        probe = probe.parent().unwrap_or_else(|| Path::new("/"));
    }
    let stat = nix::sys::statvfs::statvfs(probe)
        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
    Ok(stat.blocks_available() * stat.fragment_size())
}
