//! Request and response bodies of `POST /upload`.

use serde::{Deserialize, Serialize};

/// A folder or name label that clients may send either as text or as a
/// non-negative number.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Label {
    Number(u64),
    Text(String),
}

impl Label {
    /// Trimmed text form; blank labels count as absent.
    pub fn into_text(self) -> Option<String> {
        let text = match self {
            Label::Number(n) => n.to_string(),
            Label::Text(s) => s.trim().to_string(),
        };
        (!text.is_empty()).then_some(text)
    }
}

/// JSON upload body carrying the image as a base64 data URL.
#[derive(Debug, Deserialize)]
pub struct DataUrlUpload {
    pub filename: String,
    pub data_url: String,
    pub registro: Option<Label>,
    pub ponto: Option<Label>,
}

/// Successful upload result.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UploadResponse {
    /// Absolute public URL of the stored image.
    pub link: String,
    /// Path relative to the storage root, e.g. `batch1/foto.jpg`.
    pub path: String,
    pub filename: String,
    pub registro: Option<String>,
    pub ponto: Option<String>,
    pub mime: String,
    pub size: u64,
    pub etag: String,
}

/// Split a `<registro>-<ponto>.<ext>` file name into its labels.
///
/// Both labels must be decimal digits and the extension an accepted image
/// extension; anything else yields `None`.
pub fn labels_from_file_name(name: &str) -> Option<(String, String)> {
    let (stem, ext) = name.rsplit_once('.')?;
    if !matches!(
        ext.to_ascii_lowercase().as_str(),
        "jpg" | "jpeg" | "png" | "webp"
    ) {
        return None;
    }
    let (registro, ponto) = stem.split_once('-')?;
    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if all_digits(registro) && all_digits(ponto) {
        Some((registro.to_string(), ponto.to_string()))
    } else {
        None
    }
}
