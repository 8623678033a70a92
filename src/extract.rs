//! Archive decoding: one [`Decoder`] per supported format.

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Component, Path, PathBuf};
use tar::Archive;
use tracing::{debug, warn};

/// On-disk format of a fetched file.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveFormat {
    /// Used as-is.
    Raw,
    /// A single gzip-compressed file.
    Gzip,
    Tar,
    TarGz,
}

impl ArchiveFormat {
    /// Infers the format from a file name's extension.
    pub fn from_file_name(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            ArchiveFormat::TarGz
        } else if lower.ends_with(".tar") {
            ArchiveFormat::Tar
        } else if lower.ends_with(".gz") {
            ArchiveFormat::Gzip
        } else {
            ArchiveFormat::Raw
        }
    }

    pub fn decoder(self) -> Box<dyn Decoder> {
        match self {
            ArchiveFormat::Raw => Box::new(RawDecoder),
            ArchiveFormat::Gzip => Box::new(GzipDecoder),
            ArchiveFormat::Tar => Box::new(TarDecoder),
            ArchiveFormat::TarGz => Box::new(TarGzDecoder),
        }
    }
}

/// Turns one verified download into the files it contains.
pub trait Decoder: Send + Sync {
    /// Decodes `src` (published as `file_name`) into `out_dir`.
    ///
    /// Returns the produced paths relative to `out_dir`. `src` may be
    /// consumed.
    fn decode(&self, src: &Path, file_name: &str, out_dir: &Path) -> io::Result<Vec<PathBuf>>;
}

pub struct RawDecoder;

impl Decoder for RawDecoder {
    fn decode(&self, src: &Path, file_name: &str, out_dir: &Path) -> io::Result<Vec<PathBuf>> {
        let name = PathBuf::from(plain_file_name(file_name)?);
        // Same filesystem as the scratch dir, so a rename is enough.
        std::fs::rename(src, out_dir.join(&name))?;
        Ok(vec![name])
    }
}

pub struct GzipDecoder;

impl Decoder for GzipDecoder {
    fn decode(&self, src: &Path, file_name: &str, out_dir: &Path) -> io::Result<Vec<PathBuf>> {
        let name = plain_file_name(file_name)?;
        let stem = name
            .strip_suffix(".gz")
            .or_else(|| name.strip_suffix(".GZ"))
            .unwrap_or(name);
        let name = PathBuf::from(stem);

        let reader = BufReader::with_capacity(1024 * 1024, File::open(src)?);
        let mut decoder = GzDecoder::new(reader);
        let mut out = BufWriter::new(File::create(out_dir.join(&name))?);
        let written = io::copy(&mut decoder, &mut out)?;
        out.into_inner().map_err(|e| e.into_error())?.sync_all()?;

        debug!("Decompressed {} into {} bytes", file_name, written);
        Ok(vec![name])
    }
}

pub struct TarDecoder;

impl Decoder for TarDecoder {
    fn decode(&self, src: &Path, _file_name: &str, out_dir: &Path) -> io::Result<Vec<PathBuf>> {
        let reader = BufReader::with_capacity(1024 * 1024, File::open(src)?);
        unpack(Archive::new(reader), out_dir)
    }
}

pub struct TarGzDecoder;

impl Decoder for TarGzDecoder {
    fn decode(&self, src: &Path, _file_name: &str, out_dir: &Path) -> io::Result<Vec<PathBuf>> {
        let reader = BufReader::with_capacity(1024 * 1024, File::open(src)?);
        unpack(Archive::new(GzDecoder::new(reader)), out_dir)
    }
}

/// Extracts every entry, refusing paths that escape `out_dir`.
fn unpack<R: io::Read>(mut archive: Archive<R>, out_dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut produced = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let is_file = entry.header().entry_type().is_file();

        if !entry.unpack_in(out_dir)? {
            warn!("Skipped archive entry outside of target: {}", path.display());
            continue;
        }
        if is_file {
            produced.push(path);
        }
    }

    Ok(produced)
}

/// Rejects names that would place output outside the staging directory.
fn plain_file_name(file_name: &str) -> io::Result<&str> {
    let mut components = Path::new(file_name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(file_name),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to materialize unsafe file name '{}'", file_name),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(bytes).unwrap();
        enc.finish().unwrap()
    }

    fn tar_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn format_follows_extension() {
        assert_eq!(
            ArchiveFormat::from_file_name("train-images-idx3-ubyte.gz"),
            ArchiveFormat::Gzip
        );
        assert_eq!(ArchiveFormat::from_file_name("x.tar.gz"), ArchiveFormat::TarGz);
        assert_eq!(ArchiveFormat::from_file_name("x.TGZ"), ArchiveFormat::TarGz);
        assert_eq!(ArchiveFormat::from_file_name("x.tar"), ArchiveFormat::Tar);
        assert_eq!(ArchiveFormat::from_file_name("labels.bin"), ArchiveFormat::Raw);
    }

    #[test]
    fn gzip_strips_extension() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.part");
        std::fs::write(&src, gzip(b"idx payload")).unwrap();
        let out = dir.path().join("out");
        std::fs::create_dir(&out).unwrap();

        let files = ArchiveFormat::Gzip
            .decoder()
            .decode(&src, "train-labels-idx1-ubyte.gz", &out)
            .unwrap();

        assert_eq!(files, vec![PathBuf::from("train-labels-idx1-ubyte")]);
        assert_eq!(
            std::fs::read(out.join("train-labels-idx1-ubyte")).unwrap(),
            b"idx payload"
        );
    }

    #[test]
    fn corrupt_gzip_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.part");
        std::fs::write(&src, b"definitely not gzip").unwrap();
        let result = GzipDecoder.decode(&src, "a.gz", dir.path());
        assert!(result.is_err());
    }

    #[test]
    fn raw_moves_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("blob.part");
        std::fs::write(&src, b"raw").unwrap();
        let out = dir.path().join("out");
        std::fs::create_dir(&out).unwrap();

        let files = RawDecoder.decode(&src, "blob.bin", &out).unwrap();

        assert_eq!(files, vec![PathBuf::from("blob.bin")]);
        assert!(!src.exists());
        assert_eq!(std::fs::read(out.join("blob.bin")).unwrap(), b"raw");
    }

    #[test]
    fn tar_gz_unpacks_nested_entries() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.part");
        let archive = tar_with(&[("images/0.bin", b"zero"), ("labels.bin", b"ones")]);
        std::fs::write(&src, gzip(&archive)).unwrap();
        let out = dir.path().join("out");
        std::fs::create_dir(&out).unwrap();

        let mut files = TarGzDecoder.decode(&src, "data.tar.gz", &out).unwrap();
        files.sort();

        assert_eq!(
            files,
            vec![PathBuf::from("images/0.bin"), PathBuf::from("labels.bin")]
        );
        assert_eq!(std::fs::read(out.join("images/0.bin")).unwrap(), b"zero");
    }

    #[test]
    fn unsafe_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.part");
        std::fs::write(&src, b"x").unwrap();
        assert!(RawDecoder.decode(&src, "../escape", dir.path()).is_err());
        assert!(RawDecoder.decode(&src, "/abs/path", dir.path()).is_err());
    }
}
