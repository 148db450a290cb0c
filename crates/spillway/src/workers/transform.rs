//! Prepare-stage file transforms.

use flate2::Compression;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

fn default_gzip_level() -> u32 {
    6
}

fn default_zstd_level() -> i32 {
    3
}

/// How a closed bucket file is turned into its upload artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "codec", rename_all = "lowercase")]
pub enum Transform {
    /// Upload the file as written.
    #[default]
    #[serde(rename = "none")]
    PassThrough,
    Gzip {
        #[serde(default = "default_gzip_level")]
        level: u32,
    },
    Zstd {
        #[serde(default = "default_zstd_level")]
        level: i32,
    },
}

impl Transform {
    /// Suffix appended to the origin file name, if the transform writes a new file.
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            Transform::PassThrough => None,
            Transform::Gzip { .. } => Some("gz"),
            Transform::Zstd { .. } => Some("zst"),
        }
    }

    /// Archive key recorded on the record so the artifact can be decoded.
    pub fn descriptor(&self) -> String {
        match self {
            Transform::PassThrough => "identity".to_string(),
            Transform::Gzip { level } => format!("gzip;level={level}"),
            Transform::Zstd { level } => format!("zstd;level={level}"),
        }
    }

    /// Where the artifact for `origin` goes.
    pub fn output_path(&self, origin: &Path) -> PathBuf {
        match self.extension() {
            None => origin.to_path_buf(),
            Some(ext) => {
                let mut name = origin.as_os_str().to_os_string();
                name.push(".");
                name.push(ext);
                PathBuf::from(name)
            }
        }
    }

    /// Encode `src` into `dst`. Blocking.
    ///
    /// Encodes into a uniquely named sibling first, so `dst` only ever holds
    /// a complete artifact. Returns the artifact size.
    pub fn apply(&self, src: &Path, dst: &Path) -> io::Result<u64> {
        if src == dst {
            return Ok(std::fs::metadata(src)?.len());
        }

        let mut staging = dst.as_os_str().to_os_string();
        staging.push(format!(".{}.tmp", Uuid::new_v4().simple()));
        let staging = PathBuf::from(staging);

        let written = self.encode(src, &staging).and_then(|()| std::fs::rename(&staging, dst));
        if let Err(e) = written {
            let _ = std::fs::remove_file(&staging);
            return Err(e);
        }
        Ok(std::fs::metadata(dst)?.len())
    }

    fn encode(&self, src: &Path, dst: &Path) -> io::Result<()> {
        let mut reader = BufReader::new(File::open(src)?);
        let writer = BufWriter::new(File::create(dst)?);
        match self {
            Transform::PassThrough => {
                let mut writer = writer;
                io::copy(&mut reader, &mut writer)?;
                writer.flush()
            }
            Transform::Gzip { level } => {
                let mut encoder = GzEncoder::new(writer, Compression::new(*level));
                io::copy(&mut reader, &mut encoder)?;
                encoder.finish()?.flush()
            }
            Transform::Zstd { level } => zstd::stream::copy_encode(&mut reader, writer, *level),
        }
    }
}
