// src/archive/metadata.rs

//! Image metadata inspection.
//!
//! Extracts `metadata.yaml` from an image archive without unpacking it and
//! classifies the image type from the entries seen: a `rootfs/` tree means
//! container, a `rootfs.img` file means virtual machine.

use crate::archive::compression::{self, CompressionFormat};
use crate::error::{Error, Result};
use crate::instance::InstanceType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Architectures this daemon knows how to run
const KNOWN_ARCHITECTURES: &[&str] = &[
    "i686", "x86_64", "armv7l", "aarch64", "ppc", "ppc64", "ppc64le", "s390x", "riscv64",
    "loongarch64",
];

/// Contents of an image's `metadata.yaml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub architecture: String,

    /// Unix timestamp; zero is rejected at inspection time
    #[serde(default)]
    pub creation_date: i64,

    /// Unix timestamp; zero means the image never expires
    #[serde(default)]
    pub expiry_date: i64,

    #[serde(default)]
    pub properties: HashMap<String, String>,
}

/// Validate an architecture name against the known set
pub fn validate_architecture(name: &str) -> Result<()> {
    if KNOWN_ARCHITECTURES.contains(&name) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "Unknown architecture: {}",
            name
        )))
    }
}

/// Read metadata and classify the image type from an archive on disk.
///
/// Walks the tar entries, decoding through the detected compression.
/// Stops early once both `metadata.yaml` and a rootfs entry were seen.
pub fn read_image_metadata(path: &Path) -> Result<(ImageMetadata, InstanceType)> {
    let mut file = File::open(path)?;
    let format = CompressionFormat::from_file(&mut file)?;

    match format {
        CompressionFormat::Squashfs => {
            // sqfs2tar can only read from a file path
            let mut child = compression::squashfs_to_tar(path)?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| Error::Other("sqfs2tar produced no output".to_string()))?;

            let result = scan_tar(stdout);
            let _ = child.wait();
            result
        }
        _ => {
            let decoder = compression::create_decoder(file, format)?;
            scan_tar(decoder)
        }
    }
}

fn scan_tar<R: Read>(reader: R) -> Result<(ImageMetadata, InstanceType)> {
    let mut archive = tar::Archive::new(reader);

    let mut metadata: Option<ImageMetadata> = None;
    let mut image_type: Option<InstanceType> = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let name = path.to_string_lossy().into_owned();
        let name = name.strip_prefix("./").unwrap_or(&name).to_string();

        if name == "metadata.yaml" {
            let mut raw = String::new();
            entry.read_to_string(&mut raw)?;
            metadata = Some(serde_yaml::from_str(&raw)?);
        } else if name.starts_with("rootfs/") {
            image_type = Some(InstanceType::Container);
        } else if name == "rootfs.img" {
            image_type = Some(InstanceType::VirtualMachine);
        }

        if metadata.is_some() && image_type.is_some() {
            // Done with the bits we want, no need to keep reading
            break;
        }
    }

    let metadata = metadata
        .ok_or_else(|| Error::Validation("Image is missing metadata.yaml".to_string()))?;

    validate_architecture(&metadata.architecture)?;

    if metadata.creation_date == 0 {
        return Err(Error::Validation("Missing creation date".to_string()));
    }

    // A metadata-only tarball (split image) classifies as container by
    // default; the rootfs part decides otherwise at ingest time.
    Ok((metadata, image_type.unwrap_or(InstanceType::Container)))
}
