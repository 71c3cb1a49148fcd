use std::fs::{self, OpenOptions, Permissions};
use std::io::{self, Read};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

use tar::EntryType;

use crate::error::{io_error, Error, IoResultExt, Result};

/// default cap on the number of entries read from one archive
pub const MAX_ARCHIVE_ENTRIES: usize = 100;

/// options for [`extract_flat`]
#[derive(Clone, Debug)]
pub struct ExtractOptions {
    /// reading entry `max_entries + 1` fails with `TooManyEntries`
    pub max_entries: usize,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            max_entries: MAX_ARCHIVE_ENTRIES,
        }
    }
}

/// extract a flat tar archive of regular files into `dest`.
///
/// entries must be plain names (no directory component) of regular files.
/// each file is created exclusively, so an existing name or a duplicate
/// entry fails. processing stops at the first error; files already written
/// stay in `dest` for the caller to clean up.
///
/// returns the extracted names in archive order.
pub fn extract_flat<R: Read>(archive: R, dest: &Path, opts: &ExtractOptions) -> Result<Vec<String>> {
    tracing::debug!(dest = %dest.display(), "extracting archive");

    let mut archive = tar::Archive::new(archive);
    let mut names = Vec::new();
    let entries = archive.entries().map_err(|e| archive_err(dest, e))?;

    for (count, entry) in entries.enumerate() {
        if count >= opts.max_entries {
            return Err(Error::TooManyEntries(opts.max_entries));
        }
        let mut entry = entry.map_err(|e| archive_err(dest, e))?;

        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let base = Path::new(&name).file_name().and_then(|n| n.to_str());
        if base != Some(name.as_str()) {
            return Err(Error::UnsupportedSubdirectory(name));
        }

        let kind = entry.header().entry_type();
        if !matches!(kind, EntryType::Regular | EntryType::Continuous) {
            return Err(Error::UnsupportedEntryType {
                name,
                kind: entry_type_name(kind).to_string(),
            });
        }

        let mode = entry.header().mode().map_err(|e| archive_err(dest, e))? & 0o777;
        let path = dest.join(&name);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(&path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => Error::EntryExists(path.clone()),
                _ => io_error(&path, e),
            })?;

        io::copy(&mut entry, &mut file).with_path(&path)?;
        // mode() above is filtered by the umask
        fs::set_permissions(&path, Permissions::from_mode(mode)).with_path(&path)?;

        tracing::debug!("extracted {} (mode {:o})", name, mode);
        names.push(name);
    }

    Ok(names)
}

fn archive_err(dest: &Path, e: io::Error) -> Error {
    io_error(dest, e)
}

fn entry_type_name(kind: EntryType) -> &'static str {
    match kind {
        EntryType::Directory => "directory",
        EntryType::Symlink => "symlink",
        EntryType::Link => "hardlink",
        EntryType::Char => "character device",
        EntryType::Block => "block device",
        EntryType::Fifo => "fifo",
        EntryType::GNUSparse => "sparse file",
        _ => "special file",
    }
}
