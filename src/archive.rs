//! Final archive assembly.
//!
//! The working directory is renamed to the archive stem, packed with the
//! `tar` crate and compressed with the system compressor. A SHA-256 sidecar
//! is written next to the archive.

use chrono::Local;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::remote::run_command;
use crate::staging::Staging;

/// Tool identifier at the start of every archive name.
pub const DEFAULT_ARCHIVE_TOOL: &str = "sosreport-LogCollector";

/// Archive size, in MiB, from which filters are suggested.
pub const SIZE_ADVISORY_MIB: f64 = 1000.0;

/// Extension of the checksum sidecar.
pub const CHECKSUM_EXTENSION: &str = "sha256";

const MIB: f64 = 1024.0 * 1024.0;

/// System compressor used on the tarball.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compressor {
    Xz,
    Bzip2,
}

impl Compressor {
    /// `xz` when the system provides it, `bzip2` otherwise.
    pub fn detect() -> Self {
        if Self::Xz.is_available() {
            Self::Xz
        } else {
            debug!("xz compression not available");
            Self::Bzip2
        }
    }

    /// Whether the compressor binary can be run.
    pub fn is_available(self) -> bool {
        run_command(self.program(), ["--version"])
            .map(|output| output.success())
            .unwrap_or(false)
    }

    pub fn program(self) -> &'static str {
        match self {
            Self::Xz => "xz",
            Self::Bzip2 => "bzip2",
        }
    }

    /// Archive file extension, `tar` included.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Xz => "tar.xz",
            Self::Bzip2 => "tar.bz2",
        }
    }

    /// Suffix the compressor appends to the tarball it is given.
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Xz => "xz",
            Self::Bzip2 => "bz2",
        }
    }
}

/// `<tool>-[<case>-]<timestamp>.<extension>`
pub fn archive_file_name(
    tool: &str,
    case_id: Option<&str>,
    timestamp: &str,
    compressor: Compressor,
) -> String {
    match case_id {
        Some(case) if !case.is_empty() => format!(
            "{}-{}-{}.{}",
            tool,
            case,
            timestamp,
            compressor.extension()
        ),
        _ => format!("{}-{}.{}", tool, timestamp, compressor.extension()),
    }
}

/// Archive name without the compressor suffix, `foo.tar.xz` to `foo.tar`.
pub fn tar_file_name(file_name: &str, compressor: Compressor) -> String {
    file_name
        .strip_suffix(compressor.suffix())
        .and_then(|name| name.strip_suffix('.'))
        .unwrap_or(file_name)
        .to_string()
}

/// Archive name without the `tar.<suffix>` extension.
fn archive_stem(file_name: &str, compressor: Compressor) -> String {
    file_name
        .strip_suffix(compressor.extension())
        .and_then(|name| name.strip_suffix('.'))
        .unwrap_or(file_name)
        .to_string()
}

/// Message announcing a finished archive.
pub fn summary_message(path: &Path, checksum: &str, size_bytes: u64) -> String {
    let size_mib = size_bytes as f64 / MIB;
    let mut message = format!(
        "Log files have been collected and placed in {}\n\
         The SHA-256 for this file is {} and its size is {:.1}M",
        path.display(),
        checksum,
        size_mib
    );
    if size_mib >= SIZE_ADVISORY_MIB {
        message.push_str(
            "\nYou can use the following filters in the next execution \
             -c, -d, -H to reduce the archive size.",
        );
    }
    message
}

/// Result of a successful assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub path: PathBuf,
    pub checksum_path: PathBuf,
    pub checksum: String,
    pub size_bytes: u64,
}

impl ArchiveSummary {
    pub fn message(&self) -> String {
        summary_message(&self.path, &self.checksum, self.size_bytes)
    }
}

/// Builds the final archive from a populated staging area.
#[derive(Debug, Clone)]
pub struct ArchiveAssembler {
    output_dir: PathBuf,
    tool: String,
    case_id: Option<String>,
    compressor: Compressor,
}

impl ArchiveAssembler {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            tool: DEFAULT_ARCHIVE_TOOL.to_string(),
            case_id: None,
            compressor: Compressor::detect(),
        }
    }

    pub fn tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = tool.into();
        self
    }

    pub fn case_id(mut self, case_id: Option<String>) -> Self {
        self.case_id = case_id;
        self
    }

    pub fn compressor(mut self, compressor: Compressor) -> Self {
        self.compressor = compressor;
        self
    }

    /// Pack the staging area into the output directory.
    ///
    /// The staging root is removed once the tarball is written.
    pub fn assemble(&self, staging: &Staging) -> Result<ArchiveSummary> {
        info!("Creating compressed archive...");

        if !self.output_dir.exists() {
            std::fs::create_dir_all(&self.output_dir)
                .map_err(|e| Error::io(&self.output_dir, e))?;
        }

        let timestamp = Local::now().format("%Y%m%d%H%M%S").to_string();
        let file_name = archive_file_name(
            &self.tool,
            self.case_id.as_deref(),
            &timestamp,
            self.compressor,
        );
        let stem = archive_stem(&file_name, self.compressor);
        let path = self.output_dir.join(&file_name);
        let tar_path = self
            .output_dir
            .join(tar_file_name(&file_name, self.compressor));

        let content_dir = staging.root.join(&stem);
        std::fs::rename(&staging.working, &content_dir)
            .map_err(|e| Error::io(&staging.working, e))?;

        write_tar(&tar_path, &stem, &content_dir)?;
        std::fs::remove_dir_all(&staging.root).map_err(|e| Error::io(&staging.root, e))?;

        let tar_arg = tar_path.display().to_string();
        run_command(self.compressor.program(), ["-1", tar_arg.as_str()])?.into_checked(
            "localhost",
            &format!("{} -1 {}", self.compressor.program(), tar_arg),
        )?;
        if !path.exists() {
            return Err(Error::Archive(format!(
                "{} did not produce {}",
                self.compressor.program(),
                path.display()
            )));
        }

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| Error::io(&path, e))?;

        let checksum = sha256_file(&path)?;
        let checksum_path = self
            .output_dir
            .join(format!("{}.{}", file_name, CHECKSUM_EXTENSION));
        let mut sidecar = File::create(&checksum_path).map_err(|e| Error::io(&checksum_path, e))?;
        writeln!(sidecar, "{}  {}", checksum, file_name)
            .map_err(|e| Error::io(&checksum_path, e))?;

        let size_bytes = std::fs::metadata(&path)
            .map_err(|e| Error::io(&path, e))?
            .len();

        Ok(ArchiveSummary {
            path,
            checksum_path,
            checksum,
            size_bytes,
        })
    }
}

fn write_tar(tar_path: &Path, stem: &str, content_dir: &Path) -> Result<()> {
    let file = File::create(tar_path).map_err(|e| Error::io(tar_path, e))?;
    let mut builder = tar::Builder::new(file);
    builder.follow_symlinks(false);
    builder
        .append_dir_all(stem, content_dir)
        .map_err(|e| Error::Archive(format!("{}: {}", content_dir.display(), e)))?;
    builder
        .into_inner()
        .and_then(|mut file| file.flush())
        .map_err(|e| Error::io(tar_path, e))
}

/// Hex encoded SHA-256 of a file.
pub fn sha256_file(path: &Path) -> Result<String> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    std::io::copy(&mut reader, &mut hasher).map_err(|e| Error::io(path, e))?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_file_name() {
        assert_eq!(
            archive_file_name("sosreport-LogCollector", None, "20240102030405", Compressor::Xz),
            "sosreport-LogCollector-20240102030405.tar.xz"
        );
        assert_eq!(
            archive_file_name(
                "sosreport-LogCollector",
                Some("00123"),
                "20240102030405",
                Compressor::Bzip2
            ),
            "sosreport-LogCollector-00123-20240102030405.tar.bz2"
        );
        assert_eq!(
            archive_file_name("tool", Some(""), "1", Compressor::Xz),
            "tool-1.tar.xz"
        );
    }

    #[test]
    fn test_dotted_names_keep_full_stem() {
        let name = archive_file_name(
            "collector.v2",
            Some("SR.1234"),
            "20240102030405",
            Compressor::Xz,
        );
        assert_eq!(name, "collector.v2-SR.1234-20240102030405.tar.xz");
        assert_eq!(
            tar_file_name(&name, Compressor::Xz),
            "collector.v2-SR.1234-20240102030405.tar"
        );
        assert_eq!(
            archive_stem(&name, Compressor::Xz),
            "collector.v2-SR.1234-20240102030405"
        );
        assert_eq!(
            tar_file_name("a.b-1.tar.bz2", Compressor::Bzip2),
            "a.b-1.tar"
        );
    }

    #[test]
    fn test_summary_without_advisory() {
        let message = summary_message(Path::new("/tmp/a.tar.xz"), "abc", 5 * 1024 * 1024);
        assert!(message.contains("/tmp/a.tar.xz"));
        assert!(message.contains("5.0M"));
        assert!(!message.contains("-c, -d, -H"));
    }

    #[test]
    fn test_summary_with_advisory() {
        let message = summary_message(Path::new("/tmp/a.tar.xz"), "abc", 1200 * 1024 * 1024);
        assert!(message.contains("1200.0M"));
        assert!(message.contains("-c, -d, -H to reduce the archive size"));
    }

    #[test]
    fn test_sha256_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, "abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
