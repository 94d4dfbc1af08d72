//! Byte-signature sniffing for upload content types.

/// Detect `(extension, mime type)` from a file's leading bytes.
///
/// Returns `None` when no signature matches; uploads refuse such payloads
/// rather than guessing.
#[must_use]
pub fn detect_file_type(data: &[u8]) -> Option<(&'static str, &'static str)> {
    let trimmed = trim_ascii_start(data);

    if data.starts_with(b"\xff\xd8\xff") {
        return Some((".jpg", "image/jpeg"));
    }
    if data.starts_with(b"\x89PNG\r\n\x1a\n") {
        return Some((".png", "image/png"));
    }
    if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        return Some((".gif", "image/gif"));
    }
    if data.starts_with(b"RIFF") && data.get(8..12) == Some(b"WEBP") {
        return Some((".webp", "image/webp"));
    }
    if data.starts_with(b"BM") {
        return Some((".bmp", "image/bmp"));
    }
    if data.starts_with(b"II*\x00") || data.starts_with(b"MM\x00*") {
        return Some((".tiff", "image/tiff"));
    }
    if trimmed.starts_with(b"<?xml") || trimmed.starts_with(b"<svg") {
        return Some((".svg", "image/svg+xml"));
    }
    if data.starts_with(b"%PDF") {
        return Some((".pdf", "application/pdf"));
    }
    if data.starts_with(b"PK\x03\x04") {
        return Some((".zip", "application/zip"));
    }
    if data.starts_with(b"ID3") || data.get(..2) == Some(b"\xff\xfb") {
        return Some((".mp3", "audio/mpeg"));
    }
    if data.starts_with(b"OggS") {
        return Some((".ogg", "audio/ogg"));
    }
    if data.starts_with(b"fLaC") {
        return Some((".flac", "audio/flac"));
    }
    if data.starts_with(b"RIFF") && data.get(8..12) == Some(b"WAVE") {
        return Some((".wav", "audio/wav"));
    }
    if trimmed.starts_with(b"{") || trimmed.starts_with(b"[") {
        return Some((".json", "application/json"));
    }
    if trimmed.starts_with(b"<") {
        return Some((".html", "text/html"));
    }
    if is_plain_text(data) {
        return Some((".txt", "text/plain"));
    }

    None
}

/// Derive the filename sent to the service: the caller's name when given,
/// a generated stem otherwise; the sniffed extension is appended when the
/// name has none.
#[must_use]
pub fn ensure_filename(name: Option<&str>, index: usize, ext: &str) -> String {
    let mut filename = match name.map(str::trim) {
        Some(n) if !n.is_empty() => n.to_string(),
        _ => format!("file-{index}{ext}"),
    };
    if !filename.contains('.') && !ext.is_empty() {
        filename.push_str(ext);
    }
    filename
}

fn trim_ascii_start(data: &[u8]) -> &[u8] {
    let start = data
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(data.len());
    &data[start..]
}

fn is_plain_text(data: &[u8]) -> bool {
    !data.is_empty()
        && data
            .iter()
            .take(100)
            .all(|&b| (32..=127).contains(&b) || matches!(b, 9 | 10 | 13))
}
