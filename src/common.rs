use anyhow::{Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
};

pub fn delete_if_exists(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path).with_context(|| format!("Failed deleting {}", path.display()))?;
    }
    Ok(())
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed creating {}", parent.display()))?;
    }
    Ok(())
}

/// Sibling `<name>.tmp` path used for write-then-rename rewrites.
pub fn tmp_path_for(path: &Path, fallback_name: &str) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|x| x.to_str())
        .unwrap_or(fallback_name);
    path.with_file_name(format!("{file_name}.tmp"))
}

pub fn truncate_for_log(text: &str) -> String {
    let trimmed = text.trim();
    let max_len = 300usize;
    if trimmed.len() <= max_len {
        return trimmed.to_string();
    }
    let mut cut = max_len;
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &trimmed[..cut])
}

pub fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToOwned::to_owned)
}

/// Claim ids are compared on their digits only ("657-356 095" == "657356095").
pub fn normalize_claim_id(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_digit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_claim_id_keeps_digits_only() {
        assert_eq!(normalize_claim_id(" 657-356 095 "), "657356095");
        assert_eq!(normalize_claim_id("SIN/12"), "12");
        assert_eq!(normalize_claim_id(""), "");
    }

    #[test]
    fn truncate_for_log_respects_char_boundaries() {
        let long = "ñ".repeat(400);
        let out = truncate_for_log(&long);
        assert!(out.ends_with("..."));
        assert!(out.len() <= 303);
    }

    #[test]
    fn tmp_path_sits_next_to_target() {
        let tmp = tmp_path_for(Path::new("/data/pending.jsonl"), "pending.jsonl");
        assert_eq!(tmp, PathBuf::from("/data/pending.jsonl.tmp"));
    }
}
