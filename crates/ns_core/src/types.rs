use crate::app_error::{AppError, AppResult, ErrorCode};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WsName(pub String);

impl WsName {
    pub fn parse(raw: &str) -> AppResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty()
            || trimmed != raw
            || raw.contains(|c: char| matches!(c, '/' | '\\' | ':') || c.is_control())
        {
            return Err(AppError::new(
                ErrorCode::WsNameInvalid,
                "workspace name must be non-empty and must not contain '/', '\\' or ':'",
                serde_json::json!({ "ws_name": raw }),
            ));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WsName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Workspace-relative, `/`-separated file path. Also the uid of a ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WsPath(pub String);

impl WsPath {
    pub fn parse(raw: &str) -> AppResult<Self> {
        let invalid = |reason: &str| {
            AppError::new(
                ErrorCode::WsPathInvalid,
                "invalid workspace path",
                serde_json::json!({ "ws_path": raw, "reason": reason }),
            )
        };
        if raw.is_empty() {
            return Err(invalid("empty"));
        }
        if raw.contains('\\') || raw.chars().any(char::is_control) {
            return Err(invalid("forbidden character"));
        }
        if raw
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        {
            return Err(invalid("empty or relative segment"));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Inserts `suffix` before the extension of the file name:
    /// `notes/a.md` + `-conflict` → `notes/a-conflict.md`. Dot-files and
    /// names without an extension get the suffix appended.
    pub fn with_stem_suffix(&self, suffix: &str) -> WsPath {
        let (dir, name) = match self.0.rfind('/') {
            Some(idx) => (&self.0[..=idx], &self.0[idx + 1..]),
            None => ("", self.0.as_str()),
        };
        let renamed = match name.rfind('.') {
            Some(dot) if dot > 0 => format!("{}{}{}", &name[..dot], suffix, &name[dot..]),
            _ => format!("{}{}", name, suffix),
        };
        WsPath(format!("{}{}", dir, renamed))
    }
}

impl fmt::Display for WsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
