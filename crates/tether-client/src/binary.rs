//! Sidecar binary resolution and verification.
//!
//! Released binaries follow the platform naming convention
//! `{base}-{os}-{arch}[.exe]` with `macos -> darwin`, `windows -> win32`,
//! `x86_64 -> x64`, `aarch64 -> arm64`. Each binary ships with a detached
//! `{binary}.sha256` file in `sha256sum` output format; verification is
//! opt-in and compares the full SHA-256 digest before the first spawn.

use std::{fs, path::{Path, PathBuf}};

use sha2::{Digest, Sha256};

use crate::error::SpawnError;

/// Platform-qualified binary file name for an arbitrary os/arch pair.
///
/// Split out from [`sidecar_binary_name`] so resolution is testable for
/// platforms other than the build host.
#[must_use]
pub fn binary_name_for(base: &str, os: &str, arch: &str) -> String {
    let os = match os {
        "macos" => "darwin",
        "windows" => "win32",
        other => other,
    };
    let arch = match arch {
        "x86_64" => "x64",
        "aarch64" => "arm64",
        other => other,
    };
    let extension = if os == "win32" { ".exe" } else { "" };
    format!("{base}-{os}-{arch}{extension}")
}

/// Binary file name for the build host's platform.
#[must_use]
pub fn sidecar_binary_name(base: &str) -> String {
    binary_name_for(base, std::env::consts::OS, std::env::consts::ARCH)
}

/// Locate the platform binary under `dir` and check it is runnable.
///
/// # Errors
///
/// - [`SpawnError::Missing`] if no file exists at the resolved path
/// - [`SpawnError::NotExecutable`] if the executable bit is absent (unix)
/// - [`SpawnError::Io`] if the file's metadata cannot be read
pub fn resolve_binary(dir: &Path, base: &str) -> Result<PathBuf, SpawnError> {
    let path = dir.join(sidecar_binary_name(base));

    let metadata = match fs::metadata(&path) {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return Err(SpawnError::Missing { path });
        },
        Err(error) => {
            return Err(SpawnError::Io { path, message: error.to_string() });
        },
    };

    if !metadata.is_file() {
        return Err(SpawnError::Missing { path });
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(SpawnError::NotExecutable { path });
        }
    }

    Ok(path)
}

/// Verify `binary` against its detached `.sha256` file.
///
/// The checksum file holds `"{hex-digest}  {filename}"`, the format
/// `sha256sum` emits. Digest comparison is case-insensitive.
///
/// # Errors
///
/// - [`SpawnError::ChecksumMissing`] if the `.sha256` file is absent
/// - [`SpawnError::ChecksumFormat`] if its contents do not parse
/// - [`SpawnError::ChecksumMismatch`] if the digests differ
/// - [`SpawnError::Io`] if either file cannot be read
pub fn verify_checksum(binary: &Path) -> Result<(), SpawnError> {
    let checksum_path = checksum_path_for(binary);

    let contents = match fs::read_to_string(&checksum_path) {
        Ok(contents) => contents,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return Err(SpawnError::ChecksumMissing { path: binary.to_path_buf() });
        },
        Err(error) => {
            return Err(SpawnError::Io { path: checksum_path, message: error.to_string() });
        },
    };

    let expected = parse_digest(&contents)
        .ok_or_else(|| SpawnError::ChecksumFormat { path: binary.to_path_buf() })?;

    let data = fs::read(binary)
        .map_err(|error| SpawnError::Io { path: binary.to_path_buf(), message: error.to_string() })?;
    let actual = hex::encode(Sha256::digest(&data));

    if !actual.eq_ignore_ascii_case(&expected) {
        return Err(SpawnError::ChecksumMismatch {
            path: binary.to_path_buf(),
            expected: expected.to_ascii_lowercase(),
            actual,
        });
    }

    Ok(())
}

fn checksum_path_for(binary: &Path) -> PathBuf {
    let mut name = binary.file_name().map(std::ffi::OsStr::to_owned).unwrap_or_default();
    name.push(".sha256");
    binary.with_file_name(name)
}

/// First whitespace-delimited token, if it looks like a SHA-256 hex digest.
fn parse_digest(contents: &str) -> Option<String> {
    let digest = contents.split_whitespace().next()?;
    (digest.len() == 64 && digest.bytes().all(|byte| byte.is_ascii_hexdigit()))
        .then(|| digest.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn naming_covers_release_platforms() {
        assert_eq!(binary_name_for("tether-sidecar", "macos", "aarch64"), "tether-sidecar-darwin-arm64");
        assert_eq!(binary_name_for("tether-sidecar", "macos", "x86_64"), "tether-sidecar-darwin-x64");
        assert_eq!(binary_name_for("tether-sidecar", "linux", "x86_64"), "tether-sidecar-linux-x64");
        assert_eq!(binary_name_for("tether-sidecar", "linux", "aarch64"), "tether-sidecar-linux-arm64");
        assert_eq!(binary_name_for("tether-sidecar", "windows", "x86_64"), "tether-sidecar-win32-x64.exe");
    }

    #[test]
    fn unknown_platform_passes_through() {
        assert_eq!(binary_name_for("s", "freebsd", "riscv64"), "s-freebsd-riscv64");
    }

    #[test]
    fn resolve_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let error = resolve_binary(dir.path(), "tether-sidecar").unwrap_err();
        assert!(matches!(error, SpawnError::Missing { .. }));
    }

    #[cfg(unix)]
    fn write_binary(dir: &Path, executable: bool) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(sidecar_binary_name("tether-sidecar"));
        fs::write(&path, b"#!/bin/sh\nexit 0\n").unwrap();
        let mode = if executable { 0o755 } else { 0o644 };
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    #[cfg(unix)]
    #[test]
    fn resolve_rejects_non_executable() {
        let dir = tempfile::tempdir().unwrap();
        write_binary(dir.path(), false);
        let error = resolve_binary(dir.path(), "tether-sidecar").unwrap_err();
        assert!(matches!(error, SpawnError::NotExecutable { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn resolve_accepts_executable() {
        let dir = tempfile::tempdir().unwrap();
        let expected = write_binary(dir.path(), true);
        assert_eq!(resolve_binary(dir.path(), "tether-sidecar").unwrap(), expected);
    }

    #[cfg(unix)]
    #[test]
    fn checksum_verifies_sha256sum_format() {
        let dir = tempfile::tempdir().unwrap();
        let binary = write_binary(dir.path(), true);

        let digest = hex::encode(Sha256::digest(fs::read(&binary).unwrap()));
        let name = binary.file_name().unwrap().to_string_lossy().into_owned();
        fs::write(checksum_path_for(&binary), format!("{digest}  {name}\n")).unwrap();

        verify_checksum(&binary).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn checksum_mismatch_reports_both_digests() {
        let dir = tempfile::tempdir().unwrap();
        let binary = write_binary(dir.path(), true);

        let bogus = "0".repeat(64);
        fs::write(checksum_path_for(&binary), format!("{bogus}  x\n")).unwrap();

        let error = verify_checksum(&binary).unwrap_err();
        match error {
            SpawnError::ChecksumMismatch { expected, actual, .. } => {
                assert_eq!(expected, bogus);
                assert_ne!(actual, bogus);
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn checksum_missing_and_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let binary = write_binary(dir.path(), true);

        assert!(matches!(verify_checksum(&binary).unwrap_err(), SpawnError::ChecksumMissing { .. }));

        fs::write(checksum_path_for(&binary), "not a digest\n").unwrap();
        assert!(matches!(verify_checksum(&binary).unwrap_err(), SpawnError::ChecksumFormat { .. }));
    }
}
