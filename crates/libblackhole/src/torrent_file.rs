use std::path::{Path, PathBuf};

use serde_bencode::value::Value;
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::{Error, InfoHash, Result, magnet::Magnet};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TorrentKind {
    Magnet,
    TorrentFile,
}

fn classify(path: &Path) -> Result<TorrentKind> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("torrent") => Ok(TorrentKind::TorrentFile),
        Some("magnet") => Ok(TorrentKind::Magnet),
        _ => Err(Error::UnsupportedExtension(path.to_owned())),
    }
}

fn filename_of(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_owned)
        .ok_or_else(|| Error::InvalidFilename(path.to_owned()))
}

/// A `.torrent` or `.magnet` file that has been moved out of a watch
/// directory into the processing directory. Owned by exactly one state
/// machine until it reaches a terminal state.
#[derive(Clone, Debug)]
pub struct StagedTorrent {
    original_path: PathBuf,
    staged_path: PathBuf,
    filename: String,
    kind: TorrentKind,
}

impl StagedTorrent {
    /// Moves `source` into the processing directory, keeping its filename.
    /// The extension is checked first so a stray file is left untouched.
    pub fn stage(source: &Path, processing_dir: &Path) -> Result<Self> {
        let kind = classify(source)?;
        let filename = filename_of(source)?;
        std::fs::create_dir_all(processing_dir).map_err(|source| Error::Staging {
            path: processing_dir.to_owned(),
            source,
        })?;
        let staged_path = processing_dir.join(&filename);
        debug!(from = ?source, to = ?staged_path, "staging");
        std::fs::rename(source, &staged_path).map_err(|e| Error::Staging {
            path: source.to_owned(),
            source: e,
        })?;
        Ok(Self {
            original_path: source.to_owned(),
            staged_path,
            filename,
            kind,
        })
    }

    /// Rebuilds the staged view of a file that is already sitting in the
    /// processing directory, without renaming anything. Startup recovery.
    pub fn from_processing(path: &Path) -> Result<Self> {
        let kind = classify(path)?;
        let filename = filename_of(path)?;
        Ok(Self {
            original_path: path.to_owned(),
            staged_path: path.to_owned(),
            filename,
            kind,
        })
    }

    pub fn staged_path(&self) -> &Path {
        &self.staged_path
    }

    pub fn original_path(&self) -> &Path {
        &self.original_path
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Filename without the `.torrent` / `.magnet` extension.
    pub fn stem(&self) -> &str {
        self.filename
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(&self.filename)
    }

    pub fn kind(&self) -> TorrentKind {
        self.kind
    }

    /// Reads the magnet URI from the file contents. Magnet files only.
    pub fn magnet_uri(&self) -> Result<String> {
        if self.kind != TorrentKind::Magnet {
            return Err(Error::NotAMagnet);
        }
        let uri = std::fs::read_to_string(&self.staged_path).map_err(|source| Error::ReadFile {
            path: self.staged_path.clone(),
            source,
        })?;
        Ok(uri.trim().to_owned())
    }

    pub fn info_hash(&self) -> Result<InfoHash> {
        match self.kind {
            TorrentKind::Magnet => Ok(Magnet::parse(&self.magnet_uri()?)?.info_hash),
            TorrentKind::TorrentFile => {
                let buf = std::fs::read(&self.staged_path).map_err(|source| Error::ReadFile {
                    path: self.staged_path.clone(),
                    source,
                })?;
                info_hash_of_torrent(&buf)
            }
        }
    }
}

/// SHA-1 of the re-encoded `info` dictionary of a bencoded metainfo file.
pub fn info_hash_of_torrent(buf: &[u8]) -> Result<InfoHash> {
    let torrent: Value = serde_bencode::from_bytes(buf)?;
    let info = match &torrent {
        Value::Dict(dict) => dict.get(b"info".as_slice()).ok_or(Error::NoInfoDict)?,
        _ => return Err(Error::NoInfoDict),
    };
    let encoded = serde_bencode::to_bytes(info)?;
    let digest = Sha1::digest(&encoded);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    Ok(InfoHash::new(out))
}
