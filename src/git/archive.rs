//! Tar archives of a filtered commit tree

use crate::error::{StrataError, StrataResult};
use crate::git::ls_tree::{EntryKind, LsTreeResult, Repos, MODE_EXECUTABLE, MODE_SYMLINK};
use std::io::Write;
use tar::{Builder, EntryType, Header};
use tracing::debug;

/// Write every file of `listing` into a tar stream, returning the file
/// count. The listing must come from a greedy matcher so it holds files
/// only; all entries get `mtime` so the bytes depend on the commit alone.
pub(crate) fn write_archive<W: Write>(
    out: W,
    repos: &mut Repos,
    listing: &LsTreeResult,
    mtime: u64,
) -> StrataResult<usize> {
    let mut builder = Builder::new(out);
    let mut count = 0;

    for entry in listing.entries() {
        if entry.kind != EntryKind::Blob {
            debug!("Archive: skipping {:?} entry {}", entry.kind, entry.path);
            continue;
        }
        let content = repos.blob(entry)?;

        let mut header = Header::new_gnu();
        header.set_mtime(mtime);
        header.set_uid(0);
        header.set_gid(0);

        let appended = if entry.mode == MODE_SYMLINK {
            let target = String::from_utf8_lossy(&content).into_owned();
            header.set_entry_type(EntryType::Symlink);
            header.set_mode(0o777);
            header.set_size(0);
            builder.append_link(&mut header, &entry.path, target)
        } else {
            header.set_entry_type(EntryType::Regular);
            header.set_mode(if entry.mode == MODE_EXECUTABLE { 0o755 } else { 0o644 });
            header.set_size(content.len() as u64);
            builder.append_data(&mut header, &entry.path, content.as_slice())
        };
        appended.map_err(|e| StrataError::io(format!("archiving {}", entry.path), e))?;
        count += 1;
    }

    builder
        .into_inner()
        .and_then(|mut out| out.flush())
        .map_err(|e| StrataError::io("finishing archive", e))?;
    Ok(count)
}
