pub mod files;

pub fn format_file_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    const THRESHOLD: u64 = 1024;

    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= THRESHOLD as f64 && unit_index < UNITS.len() - 1 {
        size /= THRESHOLD as f64;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

pub fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_matches('.')
        .to_string()
}

/// Last path segment of a URL with query and fragment removed.
pub fn filename_from_url(url: &str) -> Option<String> {
    let clean = url.split(['?', '#']).next()?;
    let last_segment = clean.trim_end_matches('/').rsplit('/').next()?.trim();
    if last_segment.is_empty() || last_segment.contains(':') {
        None
    } else {
        Some(sanitize_filename(last_segment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_file_size() {
        assert_eq!(format_file_size(0), "0 B");
        assert_eq!(format_file_size(512), "512 B");
        assert_eq!(format_file_size(1024), "1.0 KB");
        assert_eq!(format_file_size(1536), "1.5 KB");
        assert_eq!(format_file_size(1048576), "1.0 MB");
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("hello world.pth"), "hello_world.pth");
        assert_eq!(sanitize_filename("../weights.pt"), "_weights.pt");
        assert_eq!(sanitize_filename("valid-file_name.onnx"), "valid-file_name.onnx");
    }

    #[test]
    fn test_filename_from_url() {
        assert_eq!(
            filename_from_url("https://example.com/releases/RealESRGAN_x4plus.pth?download=1"),
            Some("RealESRGAN_x4plus.pth".to_string())
        );
        assert_eq!(
            filename_from_url("https://example.com/a/b/model.onnx#frag"),
            Some("model.onnx".to_string())
        );
        assert_eq!(filename_from_url("https://"), None);
    }
}
