use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, IoResultExt, Result};

/// build configuration, passed explicitly to the pipeline.
///
/// defaults describe the Windows 2012R2 vSphere stemcell; a TOML file can
/// override any field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// leading part of the published file name
    pub name: String,
    /// stemcell version, `DIGITS.DIGITS`
    pub version: String,
    /// trailing part of the published file name
    pub platform: String,
    /// `name:` field of the stemcell manifest
    pub manifest_name: String,
    pub operating_system: String,
    pub cloud_properties: CloudProperties,
    /// directory the finished stemcell is moved into
    pub output_dir: PathBuf,
    /// the delta file is gzip compressed
    pub gzip_delta: bool,
    /// require the delta's target checksum to match
    pub verify_checksum: bool,
    /// device block stripped from the converted descriptor, if present
    pub strip_device: Option<String>,
    /// explicit path to the conversion tool
    #[serde(skip_serializing_if = "Option::is_none")]
    pub converter: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudProperties {
    pub infrastructure: String,
    pub hypervisor: String,
}

impl Default for CloudProperties {
    fn default() -> Self {
        Self {
            infrastructure: "vsphere".to_string(),
            hypervisor: "esxi".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "bosh-stemcell".to_string(),
            version: String::new(),
            platform: "vsphere-esxi-windows2012R2-go_agent".to_string(),
            manifest_name: "bosh-vsphere-esxi-windows-2012R2-go_agent".to_string(),
            operating_system: "windows2012R2".to_string(),
            cloud_properties: CloudProperties::default(),
            output_dir: PathBuf::from("."),
            gzip_delta: false,
            verify_checksum: true,
            strip_device: Some("ethernet0".to_string()),
            converter: None,
        }
    }
}

impl Config {
    /// load config from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_path(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).with_path(path)?;
        Ok(())
    }

    /// file name of the published stemcell
    pub fn stemcell_filename(&self) -> String {
        format!("{}-{}-{}.tgz", self.name, self.version, self.platform)
    }

    /// full path the stemcell is published to
    pub fn stemcell_path(&self) -> PathBuf {
        self.output_dir.join(self.stemcell_filename())
    }

    /// check everything that can be checked before starting a build.
    /// all problems are reported together.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if let Err(e) = validate_version(&self.version) {
            problems.push(e.to_string());
        }

        if !self.output_dir.is_dir() {
            problems.push(format!(
                "output directory is not a directory: {}",
                self.output_dir.display()
            ));
        } else {
            let target = self.stemcell_path();
            if target.symlink_metadata().is_ok() {
                problems.push(format!(
                    "file ({}) already exists - refusing to overwrite",
                    target.display()
                ));
            }
        }

        if self.name.is_empty() || self.platform.is_empty() {
            problems.push("stemcell name and platform must not be empty".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidConfig(problems))
        }
    }
}

/// versions are `DIGITS.DIGITS`, e.g. `1.2` or `001.002`
pub fn validate_version(version: &str) -> Result<()> {
    let ok = version
        .split_once('.')
        .map(|(major, minor)| is_digits(major) && is_digits(minor))
        .unwrap_or(false);
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidVersion(version.to_string()))
    }
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}
