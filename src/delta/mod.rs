//! delta patch application
//!
//! turns a basis file plus an rdiff-style delta into the target file. see
//! [`wire`] for the record format and [`apply`] for the decode-while-apply
//! engine.

mod apply;
pub mod wire;

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read};
use std::path::Path;

use flate2::read::GzDecoder;

use crate::cancel::StopSignal;
use crate::error::{io_error, IoResultExt, Result};

pub use apply::{apply, PatchStats, OP_QUEUE_DEPTH};

const IO_BUFFER: usize = 64 * 1024;

/// options for [`patch_file`]
#[derive(Clone, Debug)]
pub struct PatchOptions {
    /// require and check the delta's target checksum
    pub verify: bool,
    /// the delta file is gzip compressed
    pub gzip: bool,
    /// cancels all file I/O once raised
    pub stop: StopSignal,
}

impl Default for PatchOptions {
    fn default() -> Self {
        Self {
            verify: true,
            gzip: false,
            stop: StopSignal::new(),
        }
    }
}

/// patch `basis` with `delta` into a newly created `target`.
///
/// `target` must not exist. on any failure it is removed again, so a file
/// at `target` after this returns `Ok` is always complete and verified.
pub fn patch_file(basis: &Path, delta: &Path, target: &Path, opts: &PatchOptions) -> Result<PatchStats> {
    tracing::debug!(
        basis = %basis.display(),
        delta = %delta.display(),
        target = %target.display(),
        "preparing to apply patch"
    );

    let basis_file = File::open(basis).with_path(basis)?;
    let delta_file = File::open(delta).with_path(delta)?;
    let target_file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(target)
        .with_path(target)?;

    let res = patch_open_files(basis_file, delta_file, target_file, target, opts);
    if res.is_err() {
        if let Err(e) = fs::remove_file(target) {
            tracing::warn!(target = %target.display(), "failed to remove partial target: {}", e);
        }
    }
    res
}

fn patch_open_files(
    basis: File,
    delta: File,
    target: File,
    target_path: &Path,
    opts: &PatchOptions,
) -> Result<PatchStats> {
    let stop = &opts.stop;
    let mut basis = stop.reader(basis);
    let delta_reader = BufReader::with_capacity(IO_BUFFER, stop.reader(delta));
    let delta: Box<dyn Read + Send> = if opts.gzip {
        tracing::debug!("treating delta as gzip compressed");
        Box::new(BufReader::with_capacity(IO_BUFFER, GzDecoder::new(delta_reader)))
    } else {
        Box::new(delta_reader)
    };
    let mut writer = BufWriter::with_capacity(IO_BUFFER, stop.writer(target));

    let started = std::time::Instant::now();
    let stats = apply(&mut basis, delta, &mut writer, opts.verify)?;

    let target = writer
        .into_inner()
        .map_err(|e| io_error(target_path, e.into_error()))?
        .into_inner();
    target.sync_all().with_path(target_path)?;

    tracing::debug!(
        bytes = stats.bytes_written,
        copy_ops = stats.copy_ops,
        data_ops = stats.data_ops,
        elapsed = ?started.elapsed(),
        "applied patch"
    );
    Ok(stats)
}
