//! User-facing messages, in English and Spanish.
//!
//! Every message a caller can see comes from [`MessageCause`], so the set of
//! things we can say is closed and each one has both translations. Technical
//! details (HTTP bodies, tool stderr) never go here; they live in
//! [`crate::diagnostics::StageRecord::technical_detail`].

use schemars::JsonSchema;

use crate::prelude::*;

/// A message in both of the languages we support.
#[derive(Clone, Debug, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BilingualMessage {
    /// The cause of this message, as a stable machine-readable code.
    pub code: MessageCause,

    /// English text.
    pub en: &'static str,

    /// Spanish text.
    pub es: &'static str,
}

impl From<MessageCause> for BilingualMessage {
    fn from(cause: MessageCause) -> Self {
        let (en, es) = cause.text();
        Self { code: cause, en, es }
    }
}

/// Everything we might need to tell a user about.
#[derive(Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageCause {
    /// The upload contained no bytes.
    EmptyUpload,
    /// We could not read the upload at all.
    UploadUnreadable,
    /// The upload is not a PDF, PNG or JPEG.
    UnsupportedFormat,
    /// The PDF could not be opened, or had no pages.
    PdfUnreadable,
    /// Some PDF pages could not be turned into images.
    PagesSkipped,
    /// No page produced an image we could OCR.
    NoReadablePages,
    /// The image could not be decoded.
    ImageUnreadable,
    /// Some photo clean-up steps failed and were left out.
    EnhancementSkipped,
    /// Only some of the pages were processed because of a page limit.
    PageLimitReached,
    /// An OCR engine did not answer in time.
    EngineTimeout,
    /// An OCR engine rejected our credentials, or is not configured.
    EngineAuth,
    /// An OCR engine is overloaded or rate limiting us.
    EngineRateLimited,
    /// An OCR engine returned something we could not understand.
    EngineMalformedResponse,
    /// An OCR engine failed for some other reason.
    EngineUnknown,
    /// The extracted text may be unreliable.
    LowConfidence,
    /// Neither engine found any text.
    NoTextExtracted,
}

impl MessageCause {
    /// The (English, Spanish) text for this cause.
    pub fn text(self) -> (&'static str, &'static str) {
        use MessageCause::*;
        match self {
            EmptyUpload => (
                "The uploaded file is empty.",
                "El archivo subido está vacío.",
            ),
            UploadUnreadable => (
                "We could not read the uploaded file.",
                "No pudimos leer el archivo subido.",
            ),
            UnsupportedFormat => (
                "Unsupported file type. Please upload a PDF, JPG or PNG.",
                "Tipo de archivo no compatible. Por favor suba un PDF, JPG o PNG.",
            ),
            PdfUnreadable => (
                "We could not open this PDF. It may be damaged or password-protected.",
                "No pudimos abrir este PDF. Puede estar dañado o protegido con contraseña.",
            ),
            PagesSkipped => (
                "Some pages could not be read and were skipped.",
                "Algunas páginas no se pudieron leer y se omitieron.",
            ),
            NoReadablePages => (
                "None of the pages in this document could be read. Please try a different copy or a photo.",
                "No se pudo leer ninguna página de este documento. Por favor intente con otra copia o una foto.",
            ),
            ImageUnreadable => (
                "We could not read this image. Please try another photo.",
                "No pudimos leer esta imagen. Por favor intente con otra foto.",
            ),
            EnhancementSkipped => (
                "Some image clean-up steps could not be applied. Results may be less accurate.",
                "Algunos pasos de limpieza de la imagen no se pudieron aplicar. Los resultados pueden ser menos precisos.",
            ),
            PageLimitReached => (
                "Only the first pages of this document were processed.",
                "Solo se procesaron las primeras páginas de este documento.",
            ),
            EngineTimeout => (
                "The text recognition service took too long to respond.",
                "El servicio de reconocimiento de texto tardó demasiado en responder.",
            ),
            EngineAuth => (
                "The text recognition service is not available right now.",
                "El servicio de reconocimiento de texto no está disponible en este momento.",
            ),
            EngineRateLimited => (
                "The text recognition service is busy. Please try again in a few minutes.",
                "El servicio de reconocimiento de texto está ocupado. Por favor intente de nuevo en unos minutos.",
            ),
            EngineMalformedResponse => (
                "The text recognition service returned an unexpected response.",
                "El servicio de reconocimiento de texto devolvió una respuesta inesperada.",
            ),
            EngineUnknown => (
                "The text recognition service failed.",
                "El servicio de reconocimiento de texto falló.",
            ),
            LowConfidence => (
                "Low confidence OCR; please retake a clear, well-lit photo.",
                "OCR de baja confianza; por favor vuelva a tomar una foto clara y bien iluminada.",
            ),
            NoTextExtracted => (
                "No text could be extracted. Please retake a clear, well-lit photo or upload a PDF.",
                "No se pudo extraer texto. Por favor vuelva a tomar una foto clara y bien iluminada o suba un PDF.",
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_CAUSES: &[MessageCause] = &[
        MessageCause::EmptyUpload,
        MessageCause::UploadUnreadable,
        MessageCause::UnsupportedFormat,
        MessageCause::PdfUnreadable,
        MessageCause::PagesSkipped,
        MessageCause::NoReadablePages,
        MessageCause::ImageUnreadable,
        MessageCause::EnhancementSkipped,
        MessageCause::PageLimitReached,
        MessageCause::EngineTimeout,
        MessageCause::EngineAuth,
        MessageCause::EngineRateLimited,
        MessageCause::EngineMalformedResponse,
        MessageCause::EngineUnknown,
        MessageCause::LowConfidence,
        MessageCause::NoTextExtracted,
    ];

    #[test]
    fn every_cause_has_both_languages() {
        for &cause in ALL_CAUSES {
            let (en, es) = cause.text();
            assert!(!en.is_empty(), "{cause:?} has no English text");
            assert!(!es.is_empty(), "{cause:?} has no Spanish text");
            assert_ne!(en, es, "{cause:?} is not translated");
        }
    }

    #[test]
    fn message_serializes_with_code() {
        let message = BilingualMessage::from(MessageCause::LowConfidence);
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["code"], "low_confidence");
        assert!(json["en"].as_str().unwrap().contains("retake"));
        assert!(json["es"].as_str().unwrap().contains("vuelva a tomar"));
    }
}
