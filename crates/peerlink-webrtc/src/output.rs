//! Saving received files.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Turn an advertised name into a relative path that stays inside the
/// output directory. `/` and `\` separate folders; empty, `.` and `..`
/// components are dropped.
pub fn sanitize_filename(name: &str) -> PathBuf {
    let mut path = PathBuf::new();
    for component in name.split(['/', '\\']) {
        if component.is_empty() || component == "." || component == ".." {
            continue;
        }
        let cleaned: String = component
            .chars()
            .map(|c| if c.is_control() || c == ':' { '_' } else { c })
            .collect();
        path.push(cleaned);
    }

    if path.as_os_str().is_empty() {
        PathBuf::from("download")
    } else {
        path
    }
}

/// Find next available filename by appending _2, _3, etc.
/// Example: file.txt -> file_2.txt -> file_3.txt
pub fn find_available_filename(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }

    let stem = path
        .file_stem()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let parent = path.parent().unwrap_or(Path::new("."));

    let mut i = 2u32;
    loop {
        let candidate = parent.join(format!("{}_{}{}", stem, i, ext));
        if !candidate.exists() {
            return candidate;
        }
        i += 1;
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Write a received file under `output_dir`, never overwriting an existing
/// file. Returns the path written.
pub async fn save_received_file(output_dir: &Path, name: &str, data: &[u8]) -> Result<PathBuf> {
    let target = find_available_filename(&output_dir.join(sanitize_filename(name)));
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    tokio::fs::write(&target, data)
        .await
        .with_context(|| format!("Failed to write file: {}", target.display()))?;
    Ok(target)
}
