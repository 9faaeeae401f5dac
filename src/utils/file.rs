use std::path::{Path, PathBuf};

/// Characters that must not appear in a filename component.
const HOSTILE: &[char] = &['/', ':', '\\', '?', '*', '"', '<', '>', '|'];

/// Make a title safe as a filename component: hostile characters become
/// spaces, whitespace runs collapse, ends are trimmed.
pub fn sanitize_component(raw: &str) -> String {
    let replaced: String = raw
        .chars()
        .map(|c| if HOSTILE.contains(&c) || c.is_control() { ' ' } else { c })
        .collect();
    let mut out = String::with_capacity(replaced.len());
    let mut last_space = true;
    for c in replaced.chars() {
        if c.is_whitespace() {
            if !last_space {
                out.push(' ');
            }
            last_space = true;
        } else {
            out.push(c);
            last_space = false;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

/// First free `<stem>.<ext>` in `dir`, appending ` (N)` for the smallest
/// N >= 1 on collision.
pub fn unique_destination(dir: &Path, stem: &str, ext: &str) -> PathBuf {
    let candidate = dir.join(format!("{stem}.{ext}"));
    if !candidate.exists() {
        return candidate;
    }
    let mut n = 1u32;
    loop {
        let candidate = dir.join(format!("{stem} ({n}).{ext}"));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Pick the artwork file extension for raw cover bytes, or `None` when the
/// data is not a decodable image.
pub fn cover_extension(data: &[u8]) -> Option<&'static str> {
    let format = image::guess_format(data).ok()?;
    format.extensions_str().first().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_component() {
        assert_eq!(sanitize_component("A/B: C?"), "A B C");
        assert_eq!(sanitize_component("Hello <World>"), "Hello World");
        assert_eq!(sanitize_component("  spaced\tout  "), "spaced out");
        assert_eq!(sanitize_component("plain"), "plain");
    }

    #[test]
    fn test_unique_destination_appends_counter() {
        let dir = tempfile::tempdir().unwrap();
        let first = unique_destination(dir.path(), "Book", "m4b");
        assert_eq!(first.file_name().unwrap(), "Book.m4b");

        std::fs::write(&first, b"x").unwrap();
        let second = unique_destination(dir.path(), "Book", "m4b");
        assert_eq!(second.file_name().unwrap(), "Book (1).m4b");

        std::fs::write(&second, b"x").unwrap();
        let third = unique_destination(dir.path(), "Book", "m4b");
        assert_eq!(third.file_name().unwrap(), "Book (2).m4b");
    }

    #[test]
    fn test_cover_extension_sniffing() {
        let png = [0x89u8, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
        assert_eq!(cover_extension(&png), Some("png"));

        let jpeg = [0xFFu8, 0xD8, 0xFF, 0xE0, 0, 0, 0, 0];
        assert_eq!(cover_extension(&jpeg), Some("jpg"));

        assert_eq!(cover_extension(b"not an image"), None);
    }
}
