use crate::app_error::{AppError, ErrorCode};
use crate::sync::SyncResult;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// What a button on the notification should trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationAction {
    UpdateGithubToken,
    ResolveConflict,
    ReportIssue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub severity: Severity,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<NotificationAction>,
}

impl Notification {
    pub fn new(severity: Severity, title: &str) -> Self {
        Self {
            severity,
            title: title.to_string(),
            content: None,
            action: None,
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_action(mut self, action: NotificationAction) -> Self {
        self.action = Some(action);
        self
    }
}

/// `None` for aborts: a cancelled operation is not something to report.
pub fn notification_for_error(err: &AppError) -> Option<Notification> {
    let notification = match err.code {
        ErrorCode::Aborted => return None,
        ErrorCode::AuthFailed => Notification::new(Severity::Error, "GitHub login failed")
            .with_content("Check that your GitHub token has access to the repository.")
            .with_action(NotificationAction::UpdateGithubToken),
        ErrorCode::RateLimited | ErrorCode::NetworkFailed | ErrorCode::RemoteNotFound => {
            Notification::new(Severity::Error, "GitHub API error").with_content(err.message.clone())
        }
        ErrorCode::InvalidRemoteResponse => {
            Notification::new(Severity::Error, "Invalid response from GitHub")
                .with_content(err.message.clone())
        }
        ErrorCode::EmptyWorkspaceRequired => {
            Notification::new(Severity::Error, "This operation requires an empty workspace")
                .with_content(err.message.clone())
        }
        ErrorCode::ConfigMissing | ErrorCode::ConfigInvalid => {
            Notification::new(Severity::Error, "GitHub is not configured")
                .with_content(err.message.clone())
                .with_action(NotificationAction::UpdateGithubToken)
        }
        _ => Notification::new(Severity::Error, "Something went wrong")
            .with_content(format!("{}: {}", err.code, err.message))
            .with_action(NotificationAction::ReportIssue),
    };
    Some(notification)
}

/// Nothing is shown for a clean no-op pass unless `verbose`.
pub fn notification_for_sync(result: &SyncResult, verbose: bool) -> Option<Notification> {
    match result {
        SyncResult::MergeConflict { conflict } => Some(
            Notification::new(Severity::Error, "GitHub sync failed")
                .with_content(format!(
                    "{} file(s) changed both locally and on GitHub. Resolve the conflict to continue.",
                    conflict.len()
                ))
                .with_action(NotificationAction::ResolveConflict),
        ),
        SyncResult::Ok { count: 0 } if verbose => {
            Some(Notification::new(Severity::Info, "GitHub sync completed"))
        }
        SyncResult::Ok { count: 0 } => None,
        SyncResult::Ok { count } => Some(
            Notification::new(Severity::Info, "GitHub sync completed")
                .with_content(format!("Synced {} file(s)", count)),
        ),
    }
}

pub fn notification_for_lock_busy(operation: &str) -> Notification {
    Notification::new(Severity::Info, "GitHub sync already running")
        .with_content(format!("Wait for it to finish before running {}.", operation))
}
