//! hand-off to the external VMX to OVA conversion tool

use std::env;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use crate::cancel::StopSignal;
use crate::error::{io_error, Error, Result};

const OVFTOOL: &str = "ovftool";

// how often a running tool is checked for exit or cancellation
const POLL_INTERVAL: Duration = Duration::from_millis(100);

// install locations of VMware Fusion / Workstation / standalone OVF Tool
const KNOWN_LOCATIONS: &[&str] = &[
    "/Applications/VMware Fusion.app/Contents/Library/VMware OVF Tool/ovftool",
    "/Applications/VMware OVF Tool/ovftool",
    "/usr/lib/vmware-ovftool/ovftool",
    "/usr/bin/ovftool",
    "/usr/local/bin/ovftool",
];

/// converts a hardware descriptor into a packaged OVA
pub trait Converter {
    /// convert `descriptor` into `output`. once `stop` is raised the
    /// conversion is abandoned with `Interrupted`.
    fn convert(&self, descriptor: &Path, output: &Path, stop: &StopSignal) -> Result<()>;
}

/// the VMware `ovftool` binary
#[derive(Clone, Debug)]
pub struct Ovftool {
    path: PathBuf,
}

impl Ovftool {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// find ovftool on `PATH`, then in the usual install locations
    pub fn locate() -> Result<Self> {
        let on_path = env::var_os("PATH")
            .map(|p| env::split_paths(&p).map(|dir| dir.join(OVFTOOL)).collect::<Vec<_>>())
            .unwrap_or_default();

        on_path
            .into_iter()
            .chain(KNOWN_LOCATIONS.iter().map(PathBuf::from))
            .find(|candidate| is_executable(candidate))
            .map(Self::new)
            .ok_or(Error::ConverterNotFound)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

impl Converter for Ovftool {
    fn convert(&self, descriptor: &Path, output: &Path, stop: &StopSignal) -> Result<()> {
        stop.check()?;

        let mut cmd = Command::new(&self.path);
        cmd.arg(descriptor).arg(output);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());

        tracing::debug!(tool = %self.path.display(), ?descriptor, ?output, "converting vmx to ova");
        let mut child = cmd.spawn().map_err(|e| io_error(&self.path, e))?;

        // drained on its own thread so a chatty tool never blocks on a full pipe
        let stderr = child.stderr.take();
        let drain = thread::spawn(move || {
            let mut buf = Vec::new();
            if let Some(mut pipe) = stderr {
                let _ = pipe.read_to_end(&mut buf);
            }
            buf
        });

        let status = loop {
            if stop.is_raised() {
                tracing::warn!(tool = %self.path.display(), pid = child.id(), "stopping conversion tool");
                let _ = child.kill();
                let _ = child.wait();
                // the drain thread ends once the last holder of the pipe exits
                return Err(Error::Interrupted);
            }
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(io_error(&self.path, e));
                }
            }
        };
        let stderr = drain.join().unwrap_or_default();

        if !status.success() {
            return Err(Error::ConversionFailed {
                tool: self.path.clone(),
                status: status.to_string(),
                output: String::from_utf8_lossy(&stderr).into_owned(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Instant;
    use tempfile::tempdir;

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-ovftool");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_success_runs_tool_with_paths() {
        let dir = tempdir().unwrap();
        let tool = Ovftool::new(script(dir.path(), "cp \"$1\" \"$2\""));
        let vmx = dir.path().join("image.vmx");
        let ova = dir.path().join("image.ova");
        fs::write(&vmx, b"config").unwrap();

        tool.convert(&vmx, &ova, &StopSignal::new()).unwrap();
        assert_eq!(fs::read(&ova).unwrap(), b"config");
    }

    #[test]
    fn test_failure_reports_stderr_verbatim() {
        let dir = tempdir().unwrap();
        let tool = Ovftool::new(script(
            dir.path(),
            "printf 'Error: Failed to parse\\n  line 2\\n' >&2; exit 3",
        ));

        match tool.convert(Path::new("in.vmx"), Path::new("out.ova"), &StopSignal::new()) {
            Err(Error::ConversionFailed { output, status, .. }) => {
                assert_eq!(output, "Error: Failed to parse\n  line 2\n");
                assert!(status.contains('3'));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_missing_tool_is_io_error() {
        let tool = Ovftool::new("/nonexistent/ovftool");
        assert!(matches!(
            tool.convert(Path::new("a"), Path::new("b"), &StopSignal::new()),
            Err(Error::Io { .. })
        ));
    }

    #[test]
    fn test_stop_kills_running_tool() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("finished");
        let tool = Ovftool::new(script(
            dir.path(),
            &format!("sleep 30; touch '{}'", marker.display()),
        ));

        let stop = StopSignal::new();
        let raiser = {
            let stop = stop.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(300));
                stop.raise();
            })
        };

        let started = Instant::now();
        let res = tool.convert(Path::new("in.vmx"), Path::new("out.ova"), &stop);
        raiser.join().unwrap();

        assert!(matches!(res, Err(Error::Interrupted)));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!marker.exists());
    }

    #[test]
    fn test_raised_stop_skips_tool() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("ran");
        let tool = Ovftool::new(script(dir.path(), &format!("touch '{}'", marker.display())));

        let stop = StopSignal::new();
        stop.raise();
        assert!(matches!(
            tool.convert(Path::new("in.vmx"), Path::new("out.ova"), &stop),
            Err(Error::Interrupted)
        ));
        assert!(!marker.exists());
    }
}
