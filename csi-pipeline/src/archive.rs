//! Deterministic tar helpers.
//!
//! The Docker Engine API moves files in and out of containers as tar streams, and the source
//! snapshot digest is taken over a tar rendering, so every header written here is normalized:
//! zero mtime, root ownership, and one of two permission modes.

use bytes::Bytes;
use std::io::{self, Read};
use std::path::Path;

pub const MODE_DIR: u32 = 0o755;
pub const MODE_EXECUTABLE: u32 = 0o755;
pub const MODE_FILE: u32 = 0o644;
pub const MODE_SECRET: u32 = 0o600;

/// A regular file pulled out of an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedFile {
    pub path: String,
    pub data: Vec<u8>,
}

fn normalized_header(entry_type: tar::EntryType, size: u64, mode: u32) -> io::Result<tar::Header> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_size(size);
    header.set_mode(mode);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_username("root")?;
    header.set_groupname("root")?;
    header.set_device_major(0)?;
    header.set_device_minor(0)?;
    Ok(header)
}

/// Thin wrapper over [`tar::Builder`] that only writes normalized entries.
pub struct ArchiveWriter {
    builder: tar::Builder<Vec<u8>>,
}

impl Default for ArchiveWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveWriter {
    pub fn new() -> Self {
        let mut builder = tar::Builder::new(Vec::new());
        builder.follow_symlinks(false);
        Self { builder }
    }

    pub fn directory(&mut self, path: &str) -> io::Result<()> {
        let mut header = normalized_header(tar::EntryType::Directory, 0, MODE_DIR)?;
        let path = format!("{}/", path.trim_end_matches('/'));
        self.builder.append_data(&mut header, path, io::empty())
    }

    pub fn file(&mut self, path: &str, data: &[u8], mode: u32) -> io::Result<()> {
        let mut header = normalized_header(tar::EntryType::Regular, data.len() as u64, mode)?;
        self.builder.append_data(&mut header, path, data)
    }

    pub fn symlink(&mut self, path: &str, target: &Path) -> io::Result<()> {
        let mut header = normalized_header(tar::EntryType::Symlink, 0, 0o777)?;
        header.set_link_name(target)?;
        self.builder.append_data(&mut header, path, io::empty())
    }

    pub fn finish(self) -> io::Result<Bytes> {
        Ok(Bytes::from(self.builder.into_inner()?))
    }
}

/// Archive holding exactly one file; used to drop binaries and secrets into containers.
pub fn single_file(path: &str, data: &[u8], mode: u32) -> io::Result<Bytes> {
    let mut writer = ArchiveWriter::new();
    writer.file(path.trim_start_matches('/'), data, mode)?;
    writer.finish()
}

/// Returns every regular file in the archive, in archive order.
pub fn regular_files(archive: &[u8]) -> io::Result<Vec<ArchivedFile>> {
    let mut files = vec![];
    let mut reader = tar::Archive::new(archive);

    for entry in reader.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type() != tar::EntryType::Regular {
            continue;
        }

        let path = entry.path()?.to_string_lossy().to_string();
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        files.push(ArchivedFile { path, data });
    }

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn single_file_strips_leading_slash() {
        let archive = single_file("/metricsserver", b"\x7fELF", MODE_EXECUTABLE).unwrap();
        let files = regular_files(&archive).unwrap();

        assert_eq!(
            files,
            vec![ArchivedFile {
                path: "metricsserver".into(),
                data: b"\x7fELF".to_vec(),
            }]
        );
    }

    #[test]
    fn regular_files_skips_directories_and_links() {
        let mut writer = ArchiveWriter::new();
        writer.directory("chart-out").unwrap();
        writer
            .file("chart-out/csi-metricsserver-v1.0.0.tgz", b"chart", MODE_FILE)
            .unwrap();
        writer
            .symlink("chart-out/latest.tgz", Path::new("csi-metricsserver-v1.0.0.tgz"))
            .unwrap();
        let archive = writer.finish().unwrap();

        let files = regular_files(&archive).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "chart-out/csi-metricsserver-v1.0.0.tgz");
    }

    #[test]
    fn identical_input_gives_identical_bytes() {
        let first = single_file("a", b"same", MODE_FILE).unwrap();
        let second = single_file("a", b"same", MODE_FILE).unwrap();
        assert_eq!(first, second);
    }
}
