use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use sha1::{Digest, Sha1};
use tar::{Builder, Header};

use crate::cancel::StopSignal;
use crate::error::{io_error, Error, IoResultExt, Result};

const IO_BUFFER: usize = 64 * 1024;

/// writer that hashes everything passing through it
pub struct HashingWriter<W, D> {
    inner: W,
    hasher: D,
}

impl<W: Write, D: Digest> HashingWriter<W, D> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: D::new(),
        }
    }

    /// return the inner writer and the hex digest of all bytes written
    pub fn finalize(self) -> (W, String) {
        (self.inner, hex::encode(self.hasher.finalize()))
    }
}

impl<W: Write, D: Digest> Write for HashingWriter<W, D> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

type TgzWriter = Builder<GzEncoder<HashingWriter<BufWriter<crate::cancel::CancelWriter<File>>, Sha1>>>;

/// a gzip compressed tarball being written to a fresh file
struct Tgz<'a> {
    path: &'a Path,
    builder: TgzWriter,
    stop: &'a StopSignal,
}

impl<'a> Tgz<'a> {
    fn create(path: &'a Path, stop: &'a StopSignal) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => Error::OutputExists(path.to_path_buf()),
                _ => io_error(path, e),
            })?;
        let buffered = BufWriter::with_capacity(IO_BUFFER, stop.writer(file));
        let encoder = GzEncoder::new(HashingWriter::new(buffered), Compression::default());
        Ok(Self {
            path,
            builder: Builder::new(encoder),
            stop,
        })
    }

    /// append a file from disk under its base name
    fn append(&mut self, source: &Path) -> Result<()> {
        tracing::debug!(file = %source.display(), archive = %self.path.display(), "adding file to archive");
        let name = source
            .file_name()
            .ok_or_else(|| Error::Invariant(format!("no file name in {}", source.display())))?;
        let file = File::open(source).with_path(source)?;
        let meta = file.metadata().with_path(source)?;

        let mut header = Header::new_gnu();
        header.set_metadata(&meta);
        self.builder
            .append_data(&mut header, name, self.stop.reader(file))
            .with_path(source)
    }

    /// finish the archive, returning the sha1 of the compressed file
    fn finish(self) -> Result<String> {
        let path = self.path;
        let encoder = self.builder.into_inner().with_path(path)?;
        let hashing = encoder.finish().with_path(path)?;
        let (buffered, sha1) = hashing.finalize();
        let file = buffered
            .into_inner()
            .map_err(|e| io_error(path, e.into_error()))?
            .into_inner();
        file.sync_all().with_path(path)?;
        Ok(sha1)
    }
}

/// write `files` (in order) into a new gzip tarball at `out`.
///
/// `out` must not exist; it is removed again on failure. returns the sha1
/// hex digest of the compressed output.
pub fn write_tgz(out: &Path, files: &[&Path], stop: &StopSignal) -> Result<String> {
    let started = std::time::Instant::now();
    let mut tgz = Tgz::create(out, stop)?;

    let res = files
        .iter()
        .try_for_each(|f| tgz.append(f))
        .and_then(|()| tgz.finish());

    match res {
        Ok(sha1) => {
            tracing::debug!(archive = %out.display(), %sha1, elapsed = ?started.elapsed(), "wrote archive");
            Ok(sha1)
        }
        Err(e) => {
            if let Err(rm) = fs::remove_file(out) {
                tracing::warn!(archive = %out.display(), "failed to remove partial archive: {}", rm);
            }
            Err(e)
        }
    }
}
