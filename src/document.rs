//! Turning raw uploads into [`Document`]s.

use std::{error, fmt, sync::Arc};

use crate::{messages::MessageCause, prelude::*};

/// MIME type for PDFs.
pub const PDF_MIME_TYPE: &str = "application/pdf";

/// MIME types we know how to OCR.
pub const SUPPORTED_MIME_TYPES: &[&str] = &[PDF_MIME_TYPE, "image/png", "image/jpeg"];

/// Declared types which tell us nothing, and which we replace with whatever we
/// can sniff from the bytes.
const GENERIC_MIME_TYPES: &[&str] = &[
    "application/octet-stream",
    "binary/octet-stream",
    "text/plain",
];

/// An uploaded document. Immutable once created.
#[derive(Clone)]
pub struct Document {
    /// A label for logs and debug files. Usually the file name.
    pub label: String,

    /// The MIME type we'll treat this document as.
    pub mime_type: String,

    /// The raw bytes. Shared, because several pages may be rasterized from
    /// the same PDF at once.
    pub bytes: Arc<[u8]>,
}

impl Document {
    /// Create a document from raw bytes, with an optional declared MIME type.
    pub fn from_bytes(
        label: impl Into<String>,
        bytes: Vec<u8>,
        declared_mime_type: Option<&str>,
    ) -> Result<Self, UploadError> {
        let label = label.into();
        if bytes.is_empty() {
            return Err(UploadError::new(
                MessageCause::EmptyUpload,
                format!("{label} contains no data"),
            ));
        }

        let declared = declared_mime_type
            .map(normalize_mime_type)
            .filter(|m| !m.is_empty());
        let mime_type = match declared {
            Some(declared) if !GENERIC_MIME_TYPES.contains(&declared.as_str()) => declared,
            _ => sniff_mime_type(&bytes).ok_or_else(|| {
                UploadError::new(
                    MessageCause::UnsupportedFormat,
                    format!("cannot determine file type of {label}"),
                )
            })?,
        };

        if !SUPPORTED_MIME_TYPES.contains(&mime_type.as_str()) {
            return Err(UploadError::new(
                MessageCause::UnsupportedFormat,
                format!("{label} has unsupported type {mime_type}"),
            ));
        }

        debug!(%label, %mime_type, size = bytes.len(), "parsed upload");
        Ok(Self {
            label,
            mime_type,
            bytes: bytes.into(),
        })
    }

    /// Read a document from disk.
    ///
    /// If no type is declared, we guess one from the extension, and then let
    /// the file contents overrule a generic guess.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub async fn from_path(
        path: &Path,
        declared_mime_type: Option<&str>,
    ) -> Result<Self, UploadError> {
        let bytes = tokio::fs::read(path).await.map_err(|err| {
            UploadError::new(
                MessageCause::UploadUnreadable,
                format!("cannot read {}: {}", path.display(), err),
            )
        })?;
        let guessed = mime_guess::from_path(path)
            .first()
            .map(|mime| mime.essence_str().to_owned());
        let declared = declared_mime_type.map(str::to_owned).or(guessed);
        let label = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self::from_bytes(label, bytes, declared.as_deref())
    }

    /// Is this a PDF?
    pub fn is_pdf(&self) -> bool {
        self.mime_type == PDF_MIME_TYPE
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("label", &self.label)
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Lower-case a MIME type and strip any parameters.
fn normalize_mime_type(mime_type: &str) -> String {
    let essence = mime_type.split(';').next().unwrap_or_default().trim();
    match essence.to_ascii_lowercase().as_str() {
        "image/jpg" | "image/pjpeg" => "image/jpeg".to_owned(),
        other => other.to_owned(),
    }
}

/// Figure out what a file is from its first few bytes.
fn sniff_mime_type(bytes: &[u8]) -> Option<String> {
    infer::get(bytes).map(|kind| kind.mime_type().to_owned())
}

/// We could not turn an upload into a [`Document`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadError {
    /// What to tell the user.
    pub cause: MessageCause,

    /// Technical details.
    pub message: String,
}

impl UploadError {
    fn new(cause: MessageCause, message: String) -> Self {
        Self { cause, message }
    }
}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl error::Error for UploadError {}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";
    const JPEG_MAGIC: &[u8] = b"\xff\xd8\xff\xe0\0\x10JFIF\0";

    #[test]
    fn empty_uploads_are_rejected() {
        let err = Document::from_bytes("empty.png", vec![], Some("image/png")).unwrap_err();
        assert_eq!(err.cause, MessageCause::EmptyUpload);
    }

    #[test]
    fn generic_types_are_replaced_by_sniffed_types() {
        let doc = Document::from_bytes(
            "scan",
            b"%PDF-1.7\n%\xe2\xe3\xcf\xd3\n".to_vec(),
            Some("application/octet-stream"),
        )
        .unwrap();
        assert!(doc.is_pdf());

        let doc = Document::from_bytes("photo", PNG_MAGIC.to_vec(), Some("text/plain")).unwrap();
        assert_eq!(doc.mime_type, "image/png");

        let doc = Document::from_bytes("photo", JPEG_MAGIC.to_vec(), None).unwrap();
        assert_eq!(doc.mime_type, "image/jpeg");
    }

    #[test]
    fn declared_types_are_normalized() {
        let doc = Document::from_bytes("photo", JPEG_MAGIC.to_vec(), Some("Image/JPG; q=1"))
            .unwrap();
        assert_eq!(doc.mime_type, "image/jpeg");
    }

    #[test]
    fn unsupported_types_are_rejected() {
        let err = Document::from_bytes("notes.txt", b"hello".to_vec(), Some("text/csv"))
            .unwrap_err();
        assert_eq!(err.cause, MessageCause::UnsupportedFormat);

        let err = Document::from_bytes("mystery", b"hello".to_vec(), None).unwrap_err();
        assert_eq!(err.cause, MessageCause::UnsupportedFormat);
    }

    #[tokio::test]
    async fn missing_files_are_unreadable() {
        let err = Document::from_path(Path::new("/definitely/not/here.pdf"), None)
            .await
            .unwrap_err();
        assert_eq!(err.cause, MessageCause::UploadUnreadable);
    }

    #[tokio::test]
    async fn extension_is_used_when_nothing_is_declared() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.png");
        tokio::fs::write(&path, PNG_MAGIC).await.unwrap();
        let doc = Document::from_path(&path, None).await.unwrap();
        assert_eq!(doc.mime_type, "image/png");
        assert_eq!(doc.label, "page.png");
    }
}
