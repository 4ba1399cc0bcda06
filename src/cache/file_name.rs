use sha2::{Digest, Sha256};

/// Maps a resource url to the name of its cache file.
pub trait FileNameGenerator: Send + Sync {
    fn generate(&self, url: &str) -> String;
}

/// Hex SHA-256 of the url, followed by the url's extension when it is short.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256FileNameGenerator;

const MAX_EXTENSION_LENGTH: usize = 4;

impl FileNameGenerator for Sha256FileNameGenerator {
    fn generate(&self, url: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        let hash = hex::encode(hasher.finalize());
        match extension(url) {
            Some(ext) => format!("{hash}.{ext}"),
            None => hash,
        }
    }
}

fn extension(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let last_segment = path.rsplit('/').next()?;
    let dot = last_segment.rfind('.')?;
    let ext = &last_segment[dot + 1..];
    let valid = !ext.is_empty()
        && ext.len() <= MAX_EXTENSION_LENGTH
        && ext.chars().all(|c| c.is_ascii_alphanumeric());
    valid.then_some(ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_url_same_name() {
        let generator = Sha256FileNameGenerator;
        let a = generator.generate("http://example.com/video.mp4");
        let b = generator.generate("http://example.com/video.mp4");
        assert_eq!(a, b);
        assert!(a.ends_with(".mp4"));
        assert_eq!(a.len(), 64 + 4);
    }

    #[test]
    fn test_long_or_missing_extension_is_dropped() {
        let generator = Sha256FileNameGenerator;
        assert_eq!(generator.generate("http://example.com/video").len(), 64);
        assert_eq!(generator.generate("http://example.com/a.website").len(), 64);
        assert_eq!(generator.generate("http://example.com/").len(), 64);
    }

    #[test]
    fn test_query_is_ignored_for_extension() {
        let name = Sha256FileNameGenerator.generate("http://example.com/clip.webm?token=a.b");
        assert!(name.ends_with(".webm"));
    }
}
