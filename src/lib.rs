//! stemforge - build BOSH vSphere stemcells from a patched base disk
//!
//! a base VHD plus an rdiff-style delta is turned into a published stemcell
//! tarball:
//!
//! 1. the delta is applied to the base disk ([`delta`])
//! 2. a VMX hardware descriptor is written for the patched disk ([`vmx`])
//! 3. an external tool converts the descriptor into an OVA ([`convert`])
//! 4. the OVA is unpacked ([`archive`]), its network device stripped
//!    ([`document`]), and re-packed with a [`manifest`] into the stemcell
//! 5. the stemcell is moved into the output directory
//!
//! [`Pipeline`] drives these stages inside a private workspace that is
//! deleted on failure or cancellation ([`StopSignal`]).
//!
//! # Example usage
//!
//! ```no_run
//! use std::path::Path;
//! use stemforge::{Config, Ovftool, Pipeline, StopSignal};
//!
//! let config = Config {
//!     version: "1.2".to_string(),
//!     ..Default::default()
//! };
//! config.validate().unwrap();
//!
//! let mut pipeline = Pipeline::new(config, Ovftool::locate().unwrap(), StopSignal::new());
//! let stemcell = pipeline
//!     .run(Path::new("base.vhd"), Path::new("patch.delta"))
//!     .unwrap();
//! println!("created stemcell: {}", stemcell.display());
//! ```

mod cancel;
mod config;
mod error;

pub mod archive;
pub mod convert;
pub mod delta;
pub mod document;
pub mod manifest;
pub mod pipeline;
pub mod vmx;

pub use cancel::{is_cancelled, CancelReader, CancelWriter, StopSignal};
pub use config::{validate_version, CloudProperties, Config};
pub use convert::{Converter, Ovftool};
pub use delta::{patch_file, PatchOptions, PatchStats};
pub use error::{Error, ErrorClass, IoResultExt, Result};
pub use pipeline::{Pipeline, State, Workspace};
