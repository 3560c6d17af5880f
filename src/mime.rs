//! MIME type inference: extension table, magic-byte sniffing, and the
//! text/binary heuristic described in §4.3 / §9.
//!
//! Grounded on the distilled proxy's own `mime_utils.py`: a straight lookup
//! table plus one special case for ZIP-container Office documents.

use std::path::Path;

pub const OCTET_STREAM: &str = "application/octet-stream";

const EXTENSION_MIME_MAP: &[(&str, &str)] = &[
    (".jpg", "image/jpeg"),
    (".jpeg", "image/jpeg"),
    (".png", "image/png"),
    (".gif", "image/gif"),
    (".webp", "image/webp"),
    (".bmp", "image/bmp"),
    (".svg", "image/svg+xml"),
    (".pdf", "application/pdf"),
    (".doc", "application/msword"),
    (
        ".docx",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    ),
    (".xls", "application/vnd.ms-excel"),
    (
        ".xlsx",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    ),
    (".ppt", "application/vnd.ms-powerpoint"),
    (
        ".pptx",
        "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    ),
    (".txt", "text/plain"),
    (".rtf", "application/rtf"),
    (".mp3", "audio/mpeg"),
    (".wav", "audio/wav"),
    (".ogg", "audio/ogg"),
    (".m4a", "audio/mp4"),
    (".flac", "audio/flac"),
    (".mp4", "video/mp4"),
    (".avi", "video/x-msvideo"),
    (".mov", "video/quicktime"),
    (".wmv", "video/x-ms-wmv"),
    (".flv", "video/x-flv"),
    (".webm", "video/webm"),
    (".mkv", "video/x-matroska"),
    (".js", "text/javascript"),
    (".css", "text/css"),
    (".html", "text/html"),
    (".htm", "text/html"),
    (".json", "application/json"),
    (".xml", "text/xml"),
    (".csv", "text/csv"),
    (".md", "text/markdown"),
    (".zip", "application/zip"),
    (".rar", "application/x-rar-compressed"),
    (".tar", "application/x-tar"),
    (".gz", "application/gzip"),
    (".7z", "application/x-7z-compressed"),
];

const MAGIC_SIGNATURES: &[(&[u8], &str)] = &[
    (b"%PDF-", "application/pdf"),
    (b"\x89PNG\r\n\x1a\n", "image/png"),
    (b"\xff\xd8\xff", "image/jpeg"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"PK\x03\x04", "application/zip"),
    (b"PK\x05\x06", "application/zip"),
    (b"PK\x07\x08", "application/zip"),
    (b"\x1f\x8b\x08", "application/gzip"),
    (b"Rar!\x1a\x07\x00", "application/x-rar-compressed"),
    (b"7z\xbc\xaf\x27\x1c", "application/x-7z-compressed"),
    (b"OggS", "application/ogg"),
    (b"ID3", "audio/mpeg"),
    (b"\x00\x00\x00\x18ftyp", "video/mp4"),
    (b"\x1a\x45\xdf\xa3", "video/webm"),
];

/// Infers a MIME type from a filename's extension, falling back to `fallback`.
pub fn infer_from_filename(filename: &str, fallback: &str) -> String {
    let ext = extension_of(filename);
    match ext {
        Some(ext) => EXTENSION_MIME_MAP
            .iter()
            .find(|(e, _)| *e == ext)
            .map(|(_, mime)| mime.to_string())
            .unwrap_or_else(|| fallback.to_string()),
        None => fallback.to_string(),
    }
}

fn extension_of(filename: &str) -> Option<String> {
    let lower = filename.to_lowercase();
    Path::new(&lower)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
}

/// Sniffs the MIME type of a byte sample by matching magic numbers first,
/// then falling back to the text/binary heuristic. `zip_member_probe` lets
/// callers supply the OOXML member-prefix check without this module needing
/// a ZIP reader of its own.
pub fn sniff(sample: &[u8], zip_member_probe: impl Fn(&[u8]) -> Option<&'static str>) -> Option<String> {
    if sample.is_empty() {
        return None;
    }
    for (signature, mime) in MAGIC_SIGNATURES {
        if sample.starts_with(signature) {
            if *mime == "application/zip" {
                if let Some(office_mime) = zip_member_probe(sample) {
                    return Some(office_mime.to_string());
                }
            }
            return Some(mime.to_string());
        }
    }
    if looks_like_text(sample) {
        return Some("text/plain".to_string());
    }
    None
}

/// Classifies the OOXML member prefix of a ZIP central directory listing
/// into the matching Office document MIME type.
pub fn office_mime_from_members<'a>(names: impl Iterator<Item = &'a str>) -> Option<&'static str> {
    let mut is_docx = false;
    let mut is_pptx = false;
    let mut is_xlsx = false;
    for name in names {
        if name.starts_with("word/") {
            is_docx = true;
        } else if name.starts_with("ppt/") {
            is_pptx = true;
        } else if name.starts_with("xl/") {
            is_xlsx = true;
        }
    }
    if is_docx {
        Some("application/vnd.openxmlformats-officedocument.wordprocessingml.document")
    } else if is_pptx {
        Some("application/vnd.openxmlformats-officedocument.presentationml.presentation")
    } else if is_xlsx {
        Some("application/vnd.openxmlformats-officedocument.spreadsheetml.sheet")
    } else {
        None
    }
}

fn looks_like_text(sample: &[u8]) -> bool {
    if sample.is_empty() {
        return false;
    }
    let is_text_byte = |b: u8| matches!(b, 7 | 8 | 9 | 10 | 12 | 13 | 27) || (32..127).contains(&b);
    let nontext = sample.iter().filter(|&&b| !is_text_byte(b)).count();
    (nontext as f64) / (sample.len() as f64) < 0.1
}

/// True when `mime` is missing, octet-stream, or a `text/*` mime applied to a
/// filename extension that is known to be binary — the condition under which
/// the orchestrator's mime-repair step substitutes an inferred type.
pub fn should_correct(mime: &str, filename: &str) -> bool {
    if mime.is_empty() || mime == OCTET_STREAM {
        return true;
    }
    const BINARY_EXTENSIONS: &[&str] = &[
        ".jpg", ".jpeg", ".png", ".gif", ".webp", ".bmp", ".pdf", ".mp3", ".wav", ".mp4", ".avi",
        ".mov", ".zip", ".rar", ".doc", ".docx", ".xls", ".xlsx", ".ppt", ".pptx",
    ];
    match extension_of(filename) {
        Some(ext) => BINARY_EXTENSIONS.contains(&ext.as_str()) && mime.starts_with("text/"),
        None => false,
    }
}

pub fn guess_extension(mime: &str) -> &'static str {
    for (ext, mapped) in EXTENSION_MIME_MAP {
        if *mapped == mime {
            return ext;
        }
    }
    match mime {
        "text/plain" => ".txt",
        "application/json" => ".json",
        "text/xml" | "application/xml" => ".xml",
        _ => ".bin",
    }
}

/// Builds the `file_<digest[:8]><ext>` fallback name used when neither
/// session metadata nor a source URL yields a usable filename.
pub fn build_fallback_filename(digest_hex: &str, mime: &str) -> String {
    let short = &digest_hex[..digest_hex.len().min(8)];
    format!("file_{}{}", short, guess_extension(mime))
}

/// Strips directory components and surrounding whitespace from a filename
/// taken from an untrusted source (a URL path or a declared display name).
pub fn sanitize_filename(filename: &str) -> Option<String> {
    let cleaned = Path::new(filename.trim())
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())?;
    let cleaned = cleaned.trim().to_string();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jpeg_magic_wins_over_text_content_type() {
        let mut sample = vec![0xff, 0xd8, 0xff, 0xe0];
        sample.extend_from_slice(b"rest of jpeg bytes that are not ascii text \x00\x01");
        let mime = sniff(&sample, |_| None);
        assert_eq!(mime.as_deref(), Some("image/jpeg"));
    }

    #[test]
    fn zip_without_office_members_is_plain_zip() {
        let sample = b"PK\x03\x04rest";
        let mime = sniff(sample, |_| None);
        assert_eq!(mime.as_deref(), Some("application/zip"));
    }

    #[test]
    fn zip_with_word_member_is_docx() {
        let sample = b"PK\x03\x04rest";
        let mime = sniff(sample, |_| office_mime_from_members(vec!["word/document.xml"].into_iter()));
        assert_eq!(
            mime.as_deref(),
            Some("application/vnd.openxmlformats-officedocument.wordprocessingml.document")
        );
    }

    #[test]
    fn plain_ascii_sniffs_as_text() {
        let sample = b"hello\nworld\n";
        assert_eq!(sniff(sample, |_| None).as_deref(), Some("text/plain"));
    }

    #[test]
    fn binary_noise_sniffs_as_none() {
        let sample: Vec<u8> = (0..64u8).collect();
        assert_eq!(sniff(&sample, |_| None), None);
    }

    #[test]
    fn should_correct_flags_octet_stream_and_mislabeled_binaries() {
        assert!(should_correct(OCTET_STREAM, "a.pdf"));
        assert!(should_correct("text/plain", "a.pdf"));
        assert!(!should_correct("application/pdf", "a.pdf"));
        assert!(!should_correct("text/plain", "a.txt"));
    }

    #[test]
    fn fallback_filename_uses_digest_prefix_and_extension() {
        let name = build_fallback_filename("0123456789abcdef", "image/png");
        assert_eq!(name, "file_01234567.png");
    }

    #[test]
    fn sanitize_filename_strips_directories() {
        assert_eq!(sanitize_filename("../../etc/passwd").as_deref(), Some("passwd"));
        assert_eq!(sanitize_filename("  report.pdf  ").as_deref(), Some("report.pdf"));
    }
}
