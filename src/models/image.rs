//! Stored images and the image formats the service accepts.

use serde::Serialize;

/// Image formats accepted for upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    Jpeg,
    Png,
    Webp,
}

impl ImageKind {
    pub const ALL: [ImageKind; 3] = [ImageKind::Jpeg, ImageKind::Png, ImageKind::Webp];

    pub fn mime(self) -> &'static str {
        match self {
            ImageKind::Jpeg => "image/jpeg",
            ImageKind::Png => "image/png",
            ImageKind::Webp => "image/webp",
        }
    }

    /// Canonical extension used for stored files.
    pub fn extension(self) -> &'static str {
        match self {
            ImageKind::Jpeg => "jpg",
            ImageKind::Png => "png",
            ImageKind::Webp => "webp",
        }
    }

    /// Parse a MIME type, ignoring parameters and case.
    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or("").trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.mime().eq_ignore_ascii_case(essence))
    }

    /// Infer the format from a file name's extension.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let (_, ext) = name.rsplit_once('.')?;
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(ImageKind::Jpeg),
            "png" => Some(ImageKind::Png),
            "webp" => Some(ImageKind::Webp),
            _ => None,
        }
    }

    /// Resolve the format of an upload.
    ///
    /// A recognized declared content type wins. A missing or generic
    /// (`application/octet-stream`) declaration, or a non-standard `image/*`
    /// one such as `image/jpg`, falls back to the file name.
    pub fn detect(content_type: Option<&str>, file_name: Option<&str>) -> Option<Self> {
        let by_name = || file_name.and_then(Self::from_file_name);
        match content_type.map(str::trim).filter(|ct| !ct.is_empty()) {
            Some(ct) if ct.starts_with("application/octet-stream") => by_name(),
            Some(ct) => Self::from_mime(ct).or_else(|| {
                let is_image = ct
                    .get(..6)
                    .is_some_and(|prefix| prefix.eq_ignore_ascii_case("image/"));
                if is_image { by_name() } else { None }
            }),
            None => by_name(),
        }
    }
}

/// A file committed under the storage root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredImage {
    /// Folder segment ("registro"), `misc` when none was given.
    pub folder: String,
    /// Final file name, including any collision suffix.
    pub file_name: String,
    pub kind: ImageKind,
    pub size_bytes: u64,
    /// Hex MD5 of the stored bytes.
    pub etag: String,
}

impl StoredImage {
    /// Path relative to the storage root, always `/`-separated.
    pub fn relative_path(&self) -> String {
        format!("{}/{}", self.folder, self.file_name)
    }
}
