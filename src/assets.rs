#![forbid(unsafe_code)]

//! On-disk storage for uploaded thumbnails.
//!
//! Files live flat under a single root directory and are named by 32 random
//! bytes, so the name doubles as the only access credential for the file.

use std::{
    io,
    path::{Component, Path, PathBuf},
};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use mime_guess::mime::{self, Mime};
use rand_core::{OsRng, RngCore};
use tokio::fs::{self, File, OpenOptions};

/// Number of random bytes behind every generated filename.
pub const FILENAME_KEY_BYTES: usize = 32;

/// Media types accepted for thumbnails. The declared type is trusted; file
/// contents are never sniffed.
pub const ALLOWED_THUMBNAIL_TYPES: [&str; 2] = ["image/jpeg", "image/png"];

/// Parses a `Content-Type` value, discarding parameters such as `charset`.
pub fn parse_media_type(raw: &str) -> Result<Mime, mime::FromStrError> {
    raw.trim().parse::<Mime>()
}

pub fn is_allowed_thumbnail(media_type: &Mime) -> bool {
    ALLOWED_THUMBNAIL_TYPES.contains(&media_type.essence_str())
}

/// First extension registered for `media_type`, without the leading dot.
pub fn extension_for(media_type: &Mime) -> Option<&'static str> {
    mime_guess::get_mime_extensions(media_type)
        .and_then(|extensions| extensions.first().copied())
}

/// Builds `<43 url-safe base64 chars>.<extension>` from OS randomness.
pub fn generate_filename(extension: &str) -> String {
    let mut key = [0u8; FILENAME_KEY_BYTES];
    OsRng.fill_bytes(&mut key);
    format!("{}.{extension}", URL_SAFE_NO_PAD.encode(key))
}

/// Returns true when `value` is exactly one normal path component.
pub fn is_safe_segment(value: &str) -> bool {
    let mut components = Path::new(value).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Filesystem capability rooted at the configured assets directory.
#[derive(Debug, Clone)]
pub struct AssetStore {
    root: PathBuf,
}

impl AssetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the root directory when it is missing.
    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Opens `<root>/<name>` for writing, failing if anything already exists
    /// at that path.
    pub async fn create_exclusive(&self, name: &str) -> io::Result<File> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.path_for(name))
            .await
    }

    pub async fn remove(&self, name: &str) -> io::Result<()> {
        fs::remove_file(self.path_for(name)).await
    }

    /// Maps a request segment to a stored file path, refusing anything that
    /// could escape the root.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        is_safe_segment(name).then(|| self.path_for(name))
    }

    /// Path of a stored file relative to the server, built from the normal
    /// components of the root (`./assets` and `assets` both give
    /// `assets/<name>`).
    pub fn relative_url_path(&self, name: &str) -> String {
        let mut segments: Vec<String> = self
            .root
            .components()
            .filter_map(|component| match component {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        segments.push(name.to_string());
        segments.join("/")
    }

    /// Absolute URL handed back to clients. The host is always loopback.
    pub fn public_url(&self, port: u16, name: &str) -> String {
        format!("http://localhost:{port}/{}", self.relative_url_path(name))
    }
}
