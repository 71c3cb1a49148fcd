//! the stemcell build pipeline
//!
//! drives one build through its stages inside a private workspace:
//!
//! ```text
//! Idle -> WorkspaceReady -> Patched -> Described -> Converted -> Packaged -> Published
//! ```
//!
//! any failure, including cancellation through the [`StopSignal`], moves the
//! pipeline to `Aborted` and deletes the workspace. dropping an unfinished
//! pipeline does the same.

mod workspace;

pub use workspace::Workspace;

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use nix::errno::Errno;

use crate::archive::{self, ExtractOptions};
use crate::cancel::{is_cancelled, StopSignal};
use crate::config::{validate_version, Config};
use crate::convert::Converter;
use crate::delta::{self, PatchOptions, PatchStats};
use crate::document;
use crate::error::{Error, IoResultExt, Result};
use crate::manifest::{self, MANIFEST_NAME};
use crate::vmx;

const DISK_NAME: &str = "image.vmdk";
const DESCRIPTOR_NAME: &str = "image.vmx";
const OVA_NAME: &str = "image.ova";
const OVF_DIR: &str = "ovf";
const IMAGE_NAME: &str = "image";

/// pipeline state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Idle,
    WorkspaceReady,
    Patched,
    Described,
    Converted,
    Packaged,
    Published,
    Aborted,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Published | State::Aborted)
    }
}

// paths produced by earlier stages
#[derive(Debug, Default)]
struct Artifacts {
    disk: Option<PathBuf>,
    descriptor: Option<PathBuf>,
    ova: Option<PathBuf>,
    image_sha1: Option<String>,
    stemcell: Option<PathBuf>,
}

/// one stemcell build
pub struct Pipeline<C: Converter> {
    config: Config,
    converter: C,
    stop: StopSignal,
    workspace: Workspace,
    state: State,
    artifacts: Artifacts,
}

impl<C: Converter> Pipeline<C> {
    pub fn new(config: Config, converter: C, stop: StopSignal) -> Self {
        Self::with_workspace(config, converter, stop, Workspace::new())
    }

    /// pipeline using the given (not yet created) workspace
    pub fn with_workspace(config: Config, converter: C, stop: StopSignal, workspace: Workspace) -> Self {
        Self {
            config,
            converter,
            stop,
            workspace,
            state: State::Idle,
            artifacts: Artifacts::default(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// workspace directory, if one has been created and not yet deleted
    pub fn workspace_path(&self) -> Option<&Path> {
        self.workspace.existing()
    }

    /// sha1 of the stemcell image, once packaged
    pub fn image_sha1(&self) -> Option<&str> {
        self.artifacts.image_sha1.as_deref()
    }

    /// build and publish a stemcell from `basis` patched with `delta`.
    ///
    /// returns the path of the published stemcell.
    pub fn run(&mut self, basis: &Path, delta: &Path) -> Result<PathBuf> {
        let started = Instant::now();

        self.prepare()?;
        self.patch(basis, delta)?;
        self.describe()?;
        self.convert()?;
        self.package()?;
        let stemcell = self.publish()?;

        tracing::info!(
            stemcell = %stemcell.display(),
            elapsed = ?started.elapsed(),
            "created stemcell"
        );
        Ok(stemcell)
    }

    /// create the workspace. calling again returns the same directory.
    ///
    /// a version or stemcell name that cannot form a plain file name is an
    /// `Invariant` failure; nothing is created.
    pub fn prepare(&mut self) -> Result<PathBuf> {
        self.stage(
            "workspace",
            &[State::Idle, State::WorkspaceReady],
            State::WorkspaceReady,
            |p| {
                p.check_config()?;
                Ok(p.workspace.path()?.to_path_buf())
            },
        )
    }

    fn check_config(&self) -> Result<()> {
        validate_version(&self.config.version).map_err(|e| Error::Invariant(e.to_string()))?;

        let file_name = self.config.stemcell_filename();
        let plain = Path::new(&file_name).file_name().and_then(|n| n.to_str());
        if plain != Some(file_name.as_str()) {
            return Err(Error::Invariant(format!(
                "stemcell file name is not a plain name: {:?}",
                file_name
            )));
        }
        Ok(())
    }

    /// apply the delta to the basis disk, producing the workspace disk image
    pub fn patch(&mut self, basis: &Path, delta: &Path) -> Result<PatchStats> {
        self.stage("patch", &[State::WorkspaceReady], State::Patched, |p| {
            let disk = p.workspace.join(DISK_NAME)?;
            let opts = PatchOptions {
                verify: p.config.verify_checksum,
                gzip: p.config.gzip_delta,
                stop: p.stop.clone(),
            };

            tracing::info!(basis = %basis.display(), delta = %delta.display(), "patching disk image");
            let stats = delta::patch_file(basis, delta, &disk, &opts)?;
            tracing::debug!(
                bytes = stats.bytes_written,
                copy_ops = stats.copy_ops,
                data_ops = stats.data_ops,
                "patched disk image"
            );

            p.artifacts.disk = Some(disk);
            Ok(stats)
        })
    }

    /// write the hardware descriptor for the patched disk
    pub fn describe(&mut self) -> Result<PathBuf> {
        self.stage("describe", &[State::Patched], State::Described, |p| {
            let disk_name = p
                .artifacts
                .disk
                .as_deref()
                .and_then(Path::file_name)
                .and_then(|n| n.to_str())
                .map(str::to_string)
                .ok_or_else(|| Error::Invariant("describe: no patched disk image".to_string()))?;

            let mut text = Vec::new();
            vmx::write_vmx(&disk_name, &mut text)?;

            let descriptor = p.workspace.join(DESCRIPTOR_NAME)?;
            write_new(&descriptor, &text, &p.stop)?;

            p.artifacts.descriptor = Some(descriptor.clone());
            Ok(descriptor)
        })
    }

    /// hand the descriptor to the converter
    pub fn convert(&mut self) -> Result<PathBuf> {
        self.stage("convert", &[State::Described], State::Converted, |p| {
            let descriptor = p
                .artifacts
                .descriptor
                .clone()
                .ok_or_else(|| Error::Invariant("convert: no hardware descriptor".to_string()))?;
            let ova = p.workspace.join(OVA_NAME)?;

            tracing::info!(descriptor = %descriptor.display(), "converting descriptor, this may take a while");
            let started = Instant::now();
            p.converter.convert(&descriptor, &ova, &p.stop)?;
            tracing::debug!(ova = %ova.display(), elapsed = ?started.elapsed(), "converted descriptor");

            p.artifacts.ova = Some(ova.clone());
            Ok(ova)
        })
    }

    /// unpack the converted package, strip the configured device and build
    /// the stemcell tarball (image and manifest)
    pub fn package(&mut self) -> Result<PathBuf> {
        self.stage("package", &[State::Converted], State::Packaged, |p| {
            let ova = p
                .artifacts
                .ova
                .clone()
                .ok_or_else(|| Error::Invariant("package: no converted package".to_string()))?;

            let ovf_dir = p.workspace.join(OVF_DIR)?;
            fs::create_dir(&ovf_dir).with_path(&ovf_dir)?;

            let file = File::open(&ova).with_path(&ova)?;
            let names = archive::extract_flat(
                BufReader::new(p.stop.reader(file)),
                &ovf_dir,
                &ExtractOptions::default(),
            )?;
            archive::validate_ovf_names(&names)?;

            if let Some(device) = p.config.strip_device.as_deref() {
                strip_device(&ovf_dir, &names, device, &p.stop)?;
            }

            let members: Vec<PathBuf> = archive::package_order(&names)
                .iter()
                .map(|n| ovf_dir.join(n))
                .collect();
            let members: Vec<&Path> = members.iter().map(PathBuf::as_path).collect();

            let image = p.workspace.join(IMAGE_NAME)?;
            let sha1 = archive::write_tgz(&image, &members, &p.stop)?;
            tracing::debug!(image = %image.display(), %sha1, "wrote stemcell image");

            let manifest_path = p.workspace.join(MANIFEST_NAME)?;
            let text = manifest::render(&p.config, &sha1)?;
            write_new(&manifest_path, text.as_bytes(), &p.stop)?;
            tracing::debug!(version = %p.config.version, %sha1, "wrote stemcell manifest");

            let stemcell = p.workspace.join(p.config.stemcell_filename())?;
            archive::write_tgz(&stemcell, &[image.as_path(), manifest_path.as_path()], &p.stop)?;

            p.artifacts.image_sha1 = Some(sha1);
            p.artifacts.stemcell = Some(stemcell.clone());
            Ok(stemcell)
        })
    }

    /// move the stemcell into the output directory and delete the workspace.
    ///
    /// on failure the workspace is kept so the finished package can be
    /// recovered; the error names its path.
    pub fn publish(&mut self) -> Result<PathBuf> {
        let dest = self.stage("publish", &[State::Packaged], State::Published, |p| {
            let package = p
                .artifacts
                .stemcell
                .clone()
                .ok_or_else(|| Error::Invariant("publish: no stemcell package".to_string()))?;
            let dest = p.config.stemcell_path();
            publish_file(&package, &dest, &p.stop)?;
            Ok(dest)
        })?;

        self.workspace.remove();
        Ok(dest)
    }

    /// abandon the build and delete the workspace. safe to call repeatedly.
    pub fn abort(&mut self) {
        if self.state == State::Published {
            return;
        }
        if self.state != State::Aborted {
            tracing::debug!(state = ?self.state, "aborting pipeline");
            self.state = State::Aborted;
        }
        self.workspace.remove();
    }

    fn stage<T>(
        &mut self,
        name: &'static str,
        from: &[State],
        to: State,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        if !from.contains(&self.state) {
            let err = Error::Invariant(format!("{} stage cannot run in state {:?}", name, self.state));
            return Err(self.fail(name, err));
        }

        tracing::debug!(stage = name, "starting stage");
        match self.stop.check().and_then(|()| f(self)) {
            Ok(value) => {
                self.state = to;
                tracing::info!(stage = name, state = ?to, "stage complete");
                Ok(value)
            }
            Err(e) => Err(self.fail(name, e)),
        }
    }

    fn fail(&mut self, stage: &'static str, err: Error) -> Error {
        if self.state == State::Published {
            return err;
        }

        if stage == "publish" && self.state == State::Packaged && !err.is_interrupted() {
            self.state = State::Aborted;
            if let Some(kept) = self.workspace.persist() {
                tracing::warn!(
                    workspace = %kept.display(),
                    "publishing failed, keeping workspace: {}",
                    err
                );
            }
            return err;
        }

        tracing::debug!(stage, class = ?err.class(), "stage failed: {}", err);
        self.abort();
        err
    }
}

impl<C: Converter> Drop for Pipeline<C> {
    fn drop(&mut self) {
        if self.state != State::Published {
            self.abort();
        }
    }
}

// remove the configured device from the package descriptor. a descriptor
// without the device is fine; the manifest digest is kept in step.
fn strip_device(dir: &Path, names: &[String], device: &str, stop: &StopSignal) -> Result<()> {
    let has_ext = |n: &&String, ext: &str| Path::new(n.as_str()).extension().and_then(|e| e.to_str()) == Some(ext);
    let descriptor = names
        .iter()
        .find(|n| has_ext(n, "ovf"))
        .ok_or_else(|| Error::Invariant("validated package has no descriptor".to_string()))?;

    stop.check()?;
    let path = dir.join(descriptor);
    let text = fs::read_to_string(&path).with_path(&path)?;

    let stripped = match document::remove_block(&text, device) {
        Ok(stripped) => stripped,
        Err(Error::ElementNotFound(_)) => {
            tracing::debug!(device, descriptor = %descriptor, "descriptor has no such device");
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    fs::write(&path, stripped.as_bytes()).with_path(&path)?;
    tracing::info!(device, descriptor = %descriptor, "removed device from descriptor");

    if let Some(mf) = names.iter().find(|n| has_ext(n, "mf")) {
        let mf_path = dir.join(mf);
        let manifest = fs::read_to_string(&mf_path).with_path(&mf_path)?;
        let refreshed = archive::refresh_digest(&manifest, descriptor, stripped.as_bytes())?;
        fs::write(&mf_path, refreshed).with_path(&mf_path)?;
    }
    Ok(())
}

fn write_new(path: &Path, contents: &[u8], stop: &StopSignal) -> Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_path(path)?;
    let mut out = stop.writer(file);
    out.write_all(contents).with_path(path)?;
    out.get_ref().sync_all().with_path(path)
}

// link `package` in at `dest` without ever replacing an existing file. a
// destination on another filesystem gets a copy under a hidden name first.
fn publish_file(package: &Path, dest: &Path, stop: &StopSignal) -> Result<()> {
    tracing::debug!(package = %package.display(), dest = %dest.display(), "publishing stemcell");

    let publish_err = |source: io::Error| -> Error {
        if source.kind() == io::ErrorKind::AlreadyExists {
            Error::OutputExists(dest.to_path_buf())
        } else if is_cancelled(&source) {
            Error::Interrupted
        } else {
            Error::Publish {
                package: package.to_path_buf(),
                source,
            }
        }
    };

    // the workspace copy goes away with the workspace
    match fs::hard_link(package, dest) {
        Ok(()) => return Ok(()),
        Err(e) if e.raw_os_error() == Some(Errno::EXDEV as i32) => {
            tracing::debug!("output directory is on another filesystem, copying");
        }
        Err(e) => return Err(publish_err(e)),
    }

    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    let partial = dir.join(format!(".{}.partial", uuid::Uuid::new_v4()));
    let res = copy_into_place(package, &partial, dest, stop);
    if res.is_err() {
        let _ = fs::remove_file(&partial);
    }
    res.map_err(publish_err)
}

fn copy_into_place(src: &Path, partial: &Path, dest: &Path, stop: &StopSignal) -> io::Result<()> {
    let mut reader = stop.reader(File::open(src)?);
    let file = OpenOptions::new().write(true).create_new(true).open(partial)?;
    let mut writer = stop.writer(file);
    io::copy(&mut reader, &mut writer)?;
    writer.get_ref().sync_all()?;

    fs::hard_link(partial, dest)?;
    fs::remove_file(partial)
}
