use crate::config::Config;
use crate::error::{Error, Result};

/// file name of the manifest inside the stemcell
pub const MANIFEST_NAME: &str = "stemcell.MF";

/// render the stemcell manifest for an image with the given sha1
pub fn render(config: &Config, image_sha1: &str) -> Result<String> {
    if image_sha1.is_empty() {
        return Err(Error::Invariant("manifest: empty image sha1".to_string()));
    }
    if config.version.is_empty() {
        return Err(Error::Invariant("manifest: empty version".to_string()));
    }

    Ok(format!(
        "---\n\
         name: {name}\n\
         version: '{version}'\n\
         sha1: {sha1}\n\
         operating_system: {os}\n\
         cloud_properties:\n  \
         infrastructure: {infrastructure}\n  \
         hypervisor: {hypervisor}\n",
        name = config.manifest_name,
        version = config.version,
        sha1 = image_sha1,
        os = config.operating_system,
        infrastructure = config.cloud_properties.infrastructure,
        hypervisor = config.cloud_properties.hypervisor,
    ))
}
