//! VMX hardware descriptor for the patched disk
//!
//! the descriptor is handed to the conversion tool, which turns it into an
//! OVA. it deliberately declares no network adapter: an ethernet device in
//! the resulting OVF breaks deployment.

use std::io::Write;

use crate::error::{io_error, Error, Result};

const VMX_TEMPLATE: &[(&str, &str)] = &[
    (".encoding", "UTF-8"),
    ("config.version", "8"),
    ("virtualHW.version", "9"),
    ("displayName", "stemcell"),
    ("guestOS", "windows8srv-64"),
    ("numvcpus", "2"),
    ("memSize", "2048"),
    ("firmware", "bios"),
    ("scsi0.present", "TRUE"),
    ("scsi0.virtualDev", "lsisas1068"),
    ("scsi0:0.present", "TRUE"),
    ("scsi0:0.deviceType", "scsi-hardDisk"),
    ("scsi0:0.fileName", ""),
    ("floppy0.present", "FALSE"),
    ("usb.present", "FALSE"),
    ("sound.present", "FALSE"),
    ("ide1:0.present", "FALSE"),
    ("tools.syncTime", "FALSE"),
];

const DISK_KEY: &str = "scsi0:0.fileName";

/// write a VMX descriptor whose only disk is `image_name`.
///
/// `image_name` is written as given, so callers pass a name relative to
/// the directory holding the descriptor.
pub fn write_vmx<W: Write>(image_name: &str, out: &mut W) -> Result<()> {
    if image_name.is_empty() {
        return Err(Error::Invariant("vmx: empty disk image name".to_string()));
    }
    if image_name.contains(['"', '\n']) {
        return Err(Error::Invariant(format!(
            "vmx: disk image name cannot be quoted: {:?}",
            image_name
        )));
    }

    for &(key, value) in VMX_TEMPLATE {
        let value = if key == DISK_KEY { image_name } else { value };
        writeln!(out, "{} = \"{}\"", key, value).map_err(|e| io_error("<vmx>", e))?;
    }
    Ok(())
}
