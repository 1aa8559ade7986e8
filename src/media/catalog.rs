//! Local song catalog
//!
//! Songs are the `.mp3` files under a directory tree, identified by base name.

use std::path::{Path, PathBuf};

/// Whether a requested song identifier names an advertised one.
///
/// `song1` and `song1.mp3` both match an advertised `song1.mp3`.
pub fn song_matches(requested: &str, advertised: &str) -> bool {
    if requested == advertised {
        return true;
    }
    Path::new(advertised)
        .file_stem()
        .is_some_and(|stem| stem == requested)
}

fn is_mp3(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("mp3"))
}

/// Songs available on this peer
#[derive(Debug, Clone)]
pub struct SongCatalog {
    root: PathBuf,
}

impl SongCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Base names of every song, sorted. A missing directory is an empty
    /// catalog.
    pub fn songs(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .files()
            .iter()
            .filter_map(|path| path.file_name()?.to_str().map(str::to_string))
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Path of the file a song identifier refers to
    pub fn resolve(&self, song: &str) -> Option<PathBuf> {
        let mut files = self.files();
        files.sort();
        files.into_iter().find(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| song_matches(song, name))
        })
    }

    fn files(&self) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::debug!("Skipping {}: {}", dir.display(), e);
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                } else if is_mp3(&path) {
                    found.push(path);
                }
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("mob-radio-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_song_matching() {
        assert!(song_matches("song1.mp3", "song1.mp3"));
        assert!(song_matches("song1", "song1.mp3"));
        assert!(!song_matches("song", "song1.mp3"));
        assert!(!song_matches("song1.mp3", "song1"));
    }

    #[test]
    fn test_scans_recursively_for_mp3() {
        let dir = scratch_dir("scan");
        fs::create_dir_all(dir.join("album")).unwrap();
        fs::write(dir.join("b.mp3"), b"x").unwrap();
        fs::write(dir.join("album/a.MP3"), b"x").unwrap();
        fs::write(dir.join("notes.txt"), b"x").unwrap();

        let catalog = SongCatalog::new(&dir);
        assert_eq!(catalog.songs(), vec!["a.MP3".to_string(), "b.mp3".to_string()]);
        assert_eq!(catalog.resolve("a"), Some(dir.join("album/a.MP3")));
        assert!(catalog.resolve("b.mp3").is_some());
        assert!(catalog.resolve("notes").is_none());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let catalog = SongCatalog::new("/nonexistent/mob-radio/songs");
        assert!(catalog.songs().is_empty());
        assert!(catalog.resolve("anything").is_none());
    }
}
