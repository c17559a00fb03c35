//! Attachment metadata helpers shared by the history, send and push paths.

use crate::domain::Attachment;

pub const DEFAULT_PDF_FILE_NAME: &str = "Document.pdf";
pub const PDF_MIME_TYPE: &str = "application/pdf";
const FALLBACK_MIME_TYPE: &str = "image/jpeg";

pub const ALLOWED_ATTACHMENT_MIME_TYPES: &[&str] = &[
    "image/jpeg",
    "image/jpg",
    "image/png",
    "image/gif",
    "image/webp",
    PDF_MIME_TYPE,
];

pub fn is_allowed_mime_type(mime_type: &str) -> bool {
    ALLOWED_ATTACHMENT_MIME_TYPES
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(mime_type))
}

/// Guesses the MIME type of an attachment URL.
///
/// `data:` URLs carry their own type; remote URLs are matched on extension anywhere in the
/// path since CDN URLs often append transformation segments after it.
pub fn infer_mime_type(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((mime, _)) = rest.split_once(";base64,") {
            if !mime.is_empty() {
                return mime.to_string();
            }
        }
        return FALLBACK_MIME_TYPE.to_string();
    }

    let lower = url.to_ascii_lowercase();
    let mime = if lower.contains(".pdf") {
        PDF_MIME_TYPE
    } else if lower.contains(".png") {
        "image/png"
    } else if lower.contains(".jpg") || lower.contains(".jpeg") {
        "image/jpeg"
    } else if lower.contains(".gif") {
        "image/gif"
    } else if lower.contains(".webp") {
        "image/webp"
    } else {
        FALLBACK_MIME_TYPE
    };
    mime.to_string()
}

/// Assembles an [`Attachment`] from the loose fields the backend sends.
pub fn attachment_from_parts(
    url: Option<String>,
    mime_type: Option<String>,
    file_name: Option<String>,
    file_size_bytes: Option<u64>,
) -> Option<Attachment> {
    let url = url.filter(|url| !url.is_empty())?;
    let mime_type = mime_type
        .filter(|mime| !mime.is_empty())
        .unwrap_or_else(|| infer_mime_type(&url));
    let file_name = file_name.or_else(|| {
        (mime_type == PDF_MIME_TYPE).then(|| DEFAULT_PDF_FILE_NAME.to_string())
    });
    Some(Attachment {
        url,
        mime_type,
        file_name,
        file_size_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_url_prefix_wins_over_extension() {
        assert_eq!(infer_mime_type("data:image/png;base64,AAAA.pdf"), "image/png");
    }

    #[test]
    fn extension_inference_covers_cdn_urls() {
        assert_eq!(
            infer_mime_type("https://cdn.example.com/upload/v1/report.PDF"),
            PDF_MIME_TYPE
        );
        assert_eq!(infer_mime_type("https://cdn.example.com/a.webp"), "image/webp");
        assert_eq!(infer_mime_type("https://cdn.example.com/blob"), "image/jpeg");
    }

    #[test]
    fn pdf_without_name_gets_default_name() {
        let attachment = attachment_from_parts(
            Some("https://cdn.example.com/x.pdf".into()),
            None,
            None,
            Some(12),
        )
        .expect("attachment");
        assert_eq!(attachment.file_name.as_deref(), Some(DEFAULT_PDF_FILE_NAME));
        assert_eq!(attachment.mime_type, PDF_MIME_TYPE);
    }

    #[test]
    fn empty_url_means_no_attachment() {
        assert!(attachment_from_parts(Some(String::new()), None, None, None).is_none());
    }
}
