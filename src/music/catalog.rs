//! Local music library: listing, query resolution and random picks.

use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use tracing::{debug, warn};

use crate::error::{AssistantError, Result};
use crate::intent::rules::normalize;

/// Header size of a canonical 44-byte PCM WAV, used when the header cannot
/// be parsed.
const CANONICAL_DATA_OFFSET: u64 = 44;

/// A directory of `*.wav` tracks.
#[derive(Debug, Clone)]
pub struct MusicCatalog {
    dir: PathBuf,
}

impl MusicCatalog {
    /// Catalog rooted at `dir`. The directory is read lazily.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All `*.wav` files, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns [`AssistantError::Music`] if the directory cannot be read.
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| {
            AssistantError::Music(format!("cannot read {}: {e}", self.dir.display()))
        })?;
        let mut tracks: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && is_wav(path))
            .collect();
        tracks.sort();
        Ok(tracks)
    }

    /// Find the track a spoken query names.
    ///
    /// The normalized query is matched as a substring in either direction
    /// against each file stem and its `《…》` title. An exact title match
    /// wins over a partial one.
    pub fn resolve(&self, query: &str) -> Option<PathBuf> {
        let query = normalize(query);
        if query.is_empty() {
            return None;
        }
        let tracks = match self.list() {
            Ok(tracks) => tracks,
            Err(e) => {
                warn!("music catalog unavailable: {e}");
                return None;
            }
        };

        let keys = |path: &Path| -> [String; 2] {
            let stem = path
                .file_stem()
                .map(|s| normalize(&s.to_string_lossy()))
                .unwrap_or_default();
            [stem, normalize(&extract_title(path, ""))]
        };

        if let Some(exact) = tracks
            .iter()
            .find(|path| keys(path).iter().any(|k| !k.is_empty() && *k == query))
        {
            return Some(exact.clone());
        }
        let found = tracks.into_iter().find(|path| {
            keys(path)
                .iter()
                .any(|k| !k.is_empty() && (k.contains(&query) || query.contains(k.as_str())))
        });
        debug!(query = %query, found = ?found, "music query resolved");
        found
    }

    /// A random track other than `exclude`, if the library allows.
    pub fn random_excluding(&self, exclude: Option<&Path>) -> Option<PathBuf> {
        match self.list() {
            Ok(tracks) => pick_random_excluding(&tracks, exclude),
            Err(e) => {
                warn!("music catalog unavailable: {e}");
                None
            }
        }
    }
}

/// Pick a random candidate other than `exclude`. A single candidate is
/// returned even if it is the excluded one.
pub fn pick_random_excluding(candidates: &[PathBuf], exclude: Option<&Path>) -> Option<PathBuf> {
    if candidates.len() <= 1 {
        return candidates.first().cloned();
    }
    let pool: Vec<&PathBuf> = candidates
        .iter()
        .filter(|path| Some(path.as_path()) != exclude)
        .collect();
    let mut rng = rand::thread_rng();
    match pool.choose(&mut rng) {
        Some(path) => Some((*path).clone()),
        None => candidates.choose(&mut rng).cloned(),
    }
}

/// Human-readable title: the text inside `《…》` if present, otherwise the
/// file stem, otherwise `fallback`.
pub fn extract_title(path: &Path, fallback: &str) -> String {
    let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
        return fallback.to_owned();
    };
    if let Some(open) = stem.find('《') {
        let inner = &stem[open + '《'.len_utf8()..];
        if let Some(close) = inner.find('》') {
            let title = inner[..close].trim();
            if !title.is_empty() {
                return title.to_owned();
            }
        }
    }
    let stem = stem.trim();
    if stem.is_empty() {
        fallback.to_owned()
    } else {
        stem.to_owned()
    }
}

/// Where the sample data of a WAV file starts, and its format.
#[derive(Debug, Clone, Copy)]
pub struct WavLayout {
    /// Byte offset of the first sample.
    pub data_offset: u64,
    /// Format from the header, `None` if it could not be parsed.
    pub spec: Option<hound::WavSpec>,
}

/// Parse the RIFF header of `path`.
///
/// Unparseable headers fall back to the canonical 44-byte layout so raw
/// dumps with a broken header still play.
///
/// # Errors
///
/// Returns [`AssistantError::Music`] if the file cannot be opened.
pub fn probe_wav(path: &Path) -> Result<WavLayout> {
    let file = std::fs::File::open(path)
        .map_err(|e| AssistantError::Music(format!("cannot open {}: {e}", path.display())))?;
    match hound::WavReader::new(file) {
        Ok(reader) => {
            let spec = reader.spec();
            let mut file = reader.into_inner();
            let data_offset = file
                .stream_position()
                .unwrap_or(CANONICAL_DATA_OFFSET);
            Ok(WavLayout {
                data_offset,
                spec: Some(spec),
            })
        }
        Err(e) => {
            warn!(path = %path.display(), "unparseable WAV header, assuming 44 bytes: {e}");
            Ok(WavLayout {
                data_offset: CANONICAL_DATA_OFFSET,
                spec: None,
            })
        }
    }
}

/// Open `path` positioned at its sample data.
///
/// # Errors
///
/// Returns [`AssistantError::Music`] if the file cannot be opened or seeked.
pub async fn open_pcm(path: &Path) -> Result<(tokio::fs::File, WavLayout)> {
    let layout = {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || probe_wav(&path))
            .await
            .map_err(|e| AssistantError::Music(format!("WAV probe task failed: {e}")))??
    };
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| AssistantError::Music(format!("cannot open {}: {e}", path.display())))?;
    tokio::io::AsyncSeekExt::seek(&mut file, SeekFrom::Start(layout.data_offset))
        .await
        .map_err(|e| AssistantError::Music(format!("seek failed: {e}")))?;
    Ok((file, layout))
}

fn is_wav(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("wav"))
}
