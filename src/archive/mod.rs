//! flat tar archives: safe extraction, hardware package validation, and
//! writing the gzip tarballs that make up a stemcell

mod extract;
mod package;

use std::path::Path;

use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

pub use extract::{extract_flat, ExtractOptions, MAX_ARCHIVE_ENTRIES};
pub use package::{write_tgz, HashingWriter};

fn extension(name: &str) -> Option<&str> {
    Path::new(name).extension().and_then(|e| e.to_str())
}

/// check that `names` form a hardware package: exactly one `.ovf`
/// descriptor, at most one `.mf` manifest and at most one `.cert`.
pub fn validate_ovf_names<S: AsRef<str>>(names: &[S]) -> Result<()> {
    tracing::debug!(count = names.len(), "validating hardware package names");

    let with_ext = |ext: &str| -> Vec<&str> {
        names
            .iter()
            .map(|n| n.as_ref())
            .filter(|n| extension(n) == Some(ext))
            .collect()
    };

    let ovf = with_ext("ovf");
    match ovf.len() {
        0 => return Err(Error::InvalidPackage("missing .ovf file (one is required)".into())),
        1 => {}
        _ => {
            return Err(Error::InvalidPackage(format!(
                "multiple .ovf files (expected one): {}",
                ovf.join(", ")
            )))
        }
    }

    for ext in ["mf", "cert"] {
        let found = with_ext(ext);
        if found.len() > 1 {
            return Err(Error::InvalidPackage(format!(
                "multiple .{} files (expected one or zero): {}",
                ext,
                found.join(", ")
            )));
        }
    }

    Ok(())
}

/// order package members the way the OVF format wants them: descriptor
/// first, then manifest and certificate, then the rest by name.
pub fn package_order<S: AsRef<str>>(names: &[S]) -> Vec<String> {
    let rank = |n: &str| match extension(n) {
        Some("ovf") => 0,
        Some("mf") => 1,
        Some("cert") => 2,
        _ => 3,
    };
    let mut ordered: Vec<String> = names.iter().map(|n| n.as_ref().to_string()).collect();
    ordered.sort_by(|a, b| rank(a).cmp(&rank(b)).then_with(|| a.cmp(b)));
    ordered
}

/// rewrite the digest line for `name` in an OVF manifest (`.mf`) after the
/// file's contents changed.
///
/// lines look like `SHA256(vm.ovf)= <hex>`. other lines are kept as they
/// are; a manifest without a line for `name` is returned unchanged.
pub fn refresh_digest(manifest: &str, name: &str, contents: &[u8]) -> Result<String> {
    let mut out = String::with_capacity(manifest.len());
    for line in manifest.split_inclusive('\n') {
        let body = line.trim_end_matches(['\r', '\n']);
        let ending = &line[body.len()..];

        let Some((algorithm, file)) = parse_digest_line(body) else {
            out.push_str(line);
            continue;
        };
        if file != name {
            out.push_str(line);
            continue;
        }

        let digest = match algorithm {
            "SHA1" => hex::encode(Sha1::digest(contents)),
            "SHA256" => hex::encode(Sha256::digest(contents)),
            other => {
                return Err(Error::InvalidPackage(format!(
                    "unsupported digest algorithm in manifest: {}",
                    other
                )))
            }
        };
        tracing::debug!(file = name, algorithm, "refreshed manifest digest");
        out.push_str(&format!("{}({})= {}{}", algorithm, file, digest, ending));
    }
    Ok(out)
}

// `ALG(file)= hex`
fn parse_digest_line(line: &str) -> Option<(&str, &str)> {
    let (algorithm, rest) = line.split_once('(')?;
    let (file, _) = rest.rsplit_once(")=")?;
    Some((algorithm.trim(), file))
}
