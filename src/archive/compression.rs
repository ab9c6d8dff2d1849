// src/archive/compression.rs

//! Compression handling for image blobs.
//!
//! Two halves: magic-byte detection plus streaming decoders for inspecting
//! existing blobs (gzip, xz, zstd, plain tar), and subprocess-driven
//! compression for producing them. Compression always shells out to the
//! configured tool so the algorithm list matches what the host has
//! installed, not what this binary links against.

use crate::error::{Error, Result};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::process::{Command, Stdio};
use tracing::debug;

/// Compression formats recognised on image blobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionFormat {
    /// Plain tar, no compression
    None,
    /// Gzip (.gz)
    Gzip,
    /// XZ/LZMA (.xz)
    Xz,
    /// Zstandard (.zst)
    Zstd,
    /// SquashFS image
    Squashfs,
}

impl CompressionFormat {
    /// Detect compression format from magic bytes
    ///
    /// Magic bytes:
    /// - Gzip: `1f 8b`
    /// - XZ: `fd 37 7a 58 5a 00`
    /// - Zstd: `28 b5 2f fd`
    /// - SquashFS: `68 73 71 73` ("hsqs")
    pub fn from_magic_bytes(data: &[u8]) -> Self {
        if data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b {
            Self::Gzip
        } else if data.len() >= 6
            && data[0] == 0xfd
            && data[1] == 0x37
            && data[2] == 0x7a
            && data[3] == 0x58
            && data[4] == 0x5a
            && data[5] == 0x00
        {
            Self::Xz
        } else if data.len() >= 4
            && data[0] == 0x28
            && data[1] == 0xb5
            && data[2] == 0x2f
            && data[3] == 0xfd
        {
            Self::Zstd
        } else if data.len() >= 4
            && data[0] == 0x68
            && data[1] == 0x73
            && data[2] == 0x71
            && data[3] == 0x73
        {
            Self::Squashfs
        } else {
            Self::None
        }
    }

    /// Sniff the format from the first bytes of a seekable file,
    /// rewinding afterwards
    pub fn from_file(file: &mut File) -> Result<Self> {
        let mut magic = [0u8; 6];
        let n = file.read(&mut magic)?;
        file.seek(SeekFrom::Start(0))?;
        Ok(Self::from_magic_bytes(&magic[..n]))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Xz => "xz",
            Self::Zstd => "zstd",
            Self::Squashfs => "squashfs",
        }
    }
}

impl std::fmt::Display for CompressionFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Create a decompressing reader for the given format
///
/// Squashfs is not stream-decodable here; callers inspecting squashfs blobs
/// go through `squashfs_to_tar` instead.
pub fn create_decoder<'a, R: Read + 'a>(
    reader: R,
    format: CompressionFormat,
) -> Result<Box<dyn Read + 'a>> {
    match format {
        CompressionFormat::None => Ok(Box::new(reader)),
        CompressionFormat::Gzip => Ok(Box::new(flate2::read::GzDecoder::new(reader))),
        CompressionFormat::Xz => Ok(Box::new(xz2::read::XzDecoder::new(reader))),
        CompressionFormat::Zstd => {
            let decoder = zstd::Decoder::new(reader)
                .map_err(|e| Error::Other(format!("Failed to create zstd decoder: {}", e)))?;
            Ok(Box::new(decoder))
        }
        CompressionFormat::Squashfs => Err(Error::Validation(
            "SquashFS blobs cannot be decoded as a stream".to_string(),
        )),
    }
}

/// Convert a squashfs blob into a tar stream via `sqfs2tar`
///
/// Returns the child process; the caller reads its stdout and must wait on
/// it so the process is reaped.
pub fn squashfs_to_tar(path: &std::path::Path) -> Result<std::process::Child> {
    let child = Command::new("sqfs2tar")
        .arg(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| Error::Other(format!("Failed to run sqfs2tar: {}", e)))?;

    Ok(child)
}

/// Compress a stream with the named tool
///
/// The algorithm string is split shell-style so extra flags can ride along
/// (`"gzip -9"`). `gzip` gets `-n` so output is reproducible. The special
/// `squashfs` algorithm buffers through a temp file because `tar2sqfs`
/// cannot write to stdout. `none` copies bytes through unchanged.
pub fn compress_stream<R: Read + Send, W: Write>(
    algorithm: &str,
    input: &mut R,
    output: &mut W,
) -> Result<()> {
    if algorithm == "none" {
        io::copy(input, output)?;
        return Ok(());
    }

    let fields = shlex::split(algorithm)
        .ok_or_else(|| Error::Validation(format!("Invalid compression command: {}", algorithm)))?;
    if fields.is_empty() {
        return Err(Error::Validation("Empty compression command".to_string()));
    }

    if fields[0] == "squashfs" {
        return compress_squashfs(&fields[1..], input, output);
    }

    let mut args: Vec<&str> = vec!["-c"];
    args.extend(fields[1..].iter().map(|s| s.as_str()));

    // Reproducible output: strip the embedded timestamp.
    if fields[0] == "gzip" {
        args.push("-n");
    }

    debug!("Compressing stream with {} {:?}", fields[0], args);

    let mut child = Command::new(&fields[0])
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Other(format!("Failed to run {}: {}", fields[0], e)))?;

    let mut stdin = child.stdin.take().expect("stdin was piped");
    let mut stdout = child.stdout.take().expect("stdout was piped");

    // Feed and drain concurrently so neither pipe fills up.
    let feeder = std::thread::scope(|scope| -> Result<()> {
        let handle = scope.spawn(move || -> io::Result<u64> {
            let n = io::copy(input, &mut stdin)?;
            drop(stdin);
            Ok(n)
        });

        io::copy(&mut stdout, output)?;

        handle
            .join()
            .map_err(|_| Error::Other("Compressor feeder thread panicked".to_string()))??;

        Ok(())
    });

    // A compressor failure wins over whatever the feeder saw (usually a
    // broken pipe caused by that same failure).
    let status = child.wait()?;
    if !status.success() {
        return Err(Error::Other(format!(
            "Compressor {} exited with {}",
            fields[0], status
        )));
    }

    feeder?;

    Ok(())
}

/// Squashfs path: tar2sqfs writes to a file, then the result is replayed
fn compress_squashfs<R: Read, W: Write>(
    extra: &[String],
    input: &mut R,
    output: &mut W,
) -> Result<()> {
    let mut tempfile = tempfile::NamedTempFile::new()?;

    let mut args: Vec<&str> = extra.iter().map(|s| s.as_str()).collect();
    args.extend(["--no-skip", "--force", "--compressor", "xz"]);

    let mut child = Command::new("tar2sqfs")
        .args(&args)
        .arg(tempfile.path())
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Other(format!("Failed to run tar2sqfs: {}", e)))?;

    let mut stdin = child.stdin.take().expect("stdin was piped");
    io::copy(input, &mut stdin)?;
    drop(stdin);

    let out = child.wait_with_output()?;
    if !out.status.success() {
        return Err(Error::Other(format!(
            "tar2sqfs: {} ({})",
            out.status,
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }

    // Replay the result into the output stream.
    tempfile.seek(SeekFrom::Start(0))?;
    io::copy(&mut tempfile, output)?;

    Ok(())
}
