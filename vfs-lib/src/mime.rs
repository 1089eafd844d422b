/// Reserved directory marker; every other mime type denotes leaf content.
pub const DIR_MIME_TYPE: &str = "vnd.vfs.directory";
pub const OCTET_MIME_TYPE: &str = "application/octet-stream";
pub const HTML_MIME_TYPE: &str = "text/html";

/// Extension-based mime lookup with octet-stream fallback.
pub fn mime_from_name(name: &str) -> &'static str {
    let ext = match name.rsplit_once('.') {
        Some((base, ext)) if !base.is_empty() => ext.to_ascii_lowercase(),
        _ => return OCTET_MIME_TYPE,
    };
    match ext.as_str() {
        "html" | "htm" => HTML_MIME_TYPE,
        "txt" | "log" => "text/plain",
        "css" => "text/css",
        "csv" => "text/csv",
        "md" => "text/markdown",
        "js" => "text/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => OCTET_MIME_TYPE,
    }
}

/// Fill in a missing or generic mime type from the display name.
pub fn check_mime_type(mime: Option<&str>, name: &str) -> String {
    match mime {
        Some(m) if !m.is_empty() && m != OCTET_MIME_TYPE => m.to_string(),
        _ => mime_from_name(name).to_string(),
    }
}

/// Split a display name into base and extension, e.g. `"a.txt"` ->
/// `("a", Some("txt"))`. Dotfiles and extension-less names keep the whole
/// name as the base.
pub fn split_name(name: &str) -> (&str, Option<&str>) {
    match name.rsplit_once('.') {
        Some((base, ext)) if !base.is_empty() && !ext.is_empty() => (base, Some(ext)),
        _ => (name, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_lookup() {
        assert_eq!(mime_from_name("index.html"), HTML_MIME_TYPE);
        assert_eq!(mime_from_name("photo.JPG"), "image/jpeg");
        assert_eq!(mime_from_name("noext"), OCTET_MIME_TYPE);
        assert_eq!(mime_from_name(".hidden"), OCTET_MIME_TYPE);
    }

    #[test]
    fn test_check_mime_type() {
        assert_eq!(check_mime_type(Some("image/png"), "x.txt"), "image/png");
        assert_eq!(check_mime_type(None, "x.txt"), "text/plain");
        assert_eq!(check_mime_type(Some(""), "x.json"), "application/json");
        assert_eq!(check_mime_type(Some(OCTET_MIME_TYPE), "x.css"), "text/css");
    }

    #[test]
    fn test_split_name() {
        assert_eq!(split_name("file.txt"), ("file", Some("txt")));
        assert_eq!(split_name("archive.tar.gz"), ("archive.tar", Some("gz")));
        assert_eq!(split_name("README"), ("README", None));
        assert_eq!(split_name(".gitignore"), (".gitignore", None));
    }
}
