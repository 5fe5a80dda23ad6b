use std::collections::BTreeMap;
use std::path::Path;

/// Fallback for extensions not in [`CONTENT_TYPES`]
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Extension (lowercase) to MIME type
const CONTENT_TYPES: &[(&str, &str)] = &[
    // Text
    ("txt", "text/plain"),
    ("log", "text/plain"),
    ("html", "text/html"),
    ("htm", "text/html"),
    ("css", "text/css"),
    ("js", "text/javascript"),
    ("csv", "text/csv"),
    ("md", "text/markdown"),
    ("json", "application/json"),
    ("xml", "application/xml"),
    ("yaml", "application/yaml"),
    ("yml", "application/yaml"),
    // Images
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("gif", "image/gif"),
    ("svg", "image/svg+xml"),
    ("webp", "image/webp"),
    ("ico", "image/x-icon"),
    // Audio / video
    ("mp3", "audio/mpeg"),
    ("wav", "audio/wav"),
    ("mp4", "video/mp4"),
    ("mov", "video/quicktime"),
    ("webm", "video/webm"),
    // Documents and archives
    ("pdf", "application/pdf"),
    ("zip", "application/zip"),
    ("tar", "application/x-tar"),
    ("gz", "application/gzip"),
    ("parquet", "application/vnd.apache.parquet"),
];

/// Detect Content-Type from a file extension (case-insensitive)
pub fn detect_content_type(path: &Path) -> &'static str {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return DEFAULT_CONTENT_TYPE;
    };

    CONTENT_TYPES
        .iter()
        .find(|(known, _)| known.eq_ignore_ascii_case(ext))
        .map_or(DEFAULT_CONTENT_TYPE, |(_, mime)| mime)
}

/// Parse user metadata given as `key1=value1,key2=value2`.
///
/// Keys are lowercased (S3 stores `x-amz-meta-*` names that way); pairs with
/// an empty key or value are skipped. Values may contain `=`.
pub fn parse_metadata(metadata_str: &str) -> BTreeMap<String, String> {
    metadata_str
        .split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let (key, value) = (key.trim(), value.trim());

            if key.is_empty() || value.is_empty() {
                None
            } else {
                Some((key.to_ascii_lowercase(), value.to_string()))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_content_type() {
        assert_eq!(detect_content_type(Path::new("hello.txt")), "text/plain");
        assert_eq!(detect_content_type(Path::new("a/b/photo.JPG")), "image/jpeg");
        assert_eq!(detect_content_type(Path::new("archive.tar.gz")), "application/gzip");
        assert_eq!(detect_content_type(Path::new("Makefile")), DEFAULT_CONTENT_TYPE);
        assert_eq!(detect_content_type(Path::new("blob.xyz")), DEFAULT_CONTENT_TYPE);
    }

    #[test]
    fn test_parse_metadata() {
        let metadata = parse_metadata("Author=tyr, project=demo,empty=,=x,query=a=b");
        assert_eq!(metadata.get("author").map(String::as_str), Some("tyr"));
        assert_eq!(metadata.get("project").map(String::as_str), Some("demo"));
        assert_eq!(metadata.get("query").map(String::as_str), Some("a=b"));
        assert_eq!(metadata.len(), 3);
        assert!(parse_metadata("").is_empty());
    }
}
