use crate::app_error::{AppError, AppResult, ErrorCode};
use sha1::{Digest, Sha1};

/// Git blob object id of `bytes`: sha1 over `blob <len>\0<bytes>`, lowercase hex.
/// Matches the `sha` GitHub reports for tree entries, so local content can be
/// compared to the remote tree without downloading it.
pub fn git_blob_sha(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("blob {}\0", bytes.len()).as_bytes());
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn validate_git_sha(s: &str) -> AppResult<()> {
    if s.len() != 40 || !s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
        return Err(AppError::new(
            ErrorCode::InvalidRemoteResponse,
            "invalid git object sha",
            serde_json::json!({ "value": s }),
        ));
    }
    Ok(())
}

pub fn blake3_hex_prefixed(bytes: &[u8]) -> String {
    format!("blake3:{}", blake3::hash(bytes).to_hex())
}
