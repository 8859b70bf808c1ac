//! Text and JSON renderings of notification requests.

use mailwatch_jobs::Notification;
use serde_json::{Value as JsonValue, json};

pub(crate) fn notification_line(notification: &Notification) -> String {
    match notification {
        Notification::Message {
            id,
            account,
            sender,
            subject,
            actions,
            ..
        } => {
            let labels: Vec<&str> = actions.iter().map(|action| action.kind.label()).collect();
            if labels.is_empty() {
                format!("[{}] #{} {}: {}", account, id, sender, subject)
            } else {
                format!(
                    "[{}] #{} {}: {} ({})",
                    account,
                    id,
                    sender,
                    subject,
                    labels.join(", ")
                )
            }
        }
        Notification::GroupSummary {
            account, unread, ..
        } => {
            let noun = if *unread == 1 { "message" } else { "messages" };
            format!("[{}] {} unread {}", account, unread, noun)
        }
        Notification::RetireGroup { account, .. } => format!("[{}] all caught up", account),
        Notification::Cancel { id, account } => format!("[{}] #{} dismissed", account, id),
        Notification::AccountError {
            account,
            message,
            persistent,
            ..
        } => {
            let tag = if *persistent { "error" } else { "warning" };
            format!("[{}] {}: {}", account, tag, message)
        }
        Notification::LoggedOut { account, .. } => {
            format!("[{}] signed out, log in again to resume", account)
        }
        Notification::ServiceError { message } => format!("service error: {}", message),
        Notification::Transient { message } => message.clone(),
    }
}

pub(crate) fn notification_to_json(notification: &Notification) -> JsonValue {
    let kind = match notification {
        Notification::Message { .. } => "message",
        Notification::GroupSummary { .. } => "group_summary",
        Notification::RetireGroup { .. } => "retire_group",
        Notification::Cancel { .. } => "cancel",
        Notification::AccountError { .. } => "account_error",
        Notification::LoggedOut { .. } => "logged_out",
        Notification::ServiceError { .. } => "service_error",
        Notification::Transient { .. } => "transient",
    };
    let mut value = json!({
        "kind": kind,
        "persistent": notification.is_persistent(),
        "text": notification_line(notification),
    });
    let id = match notification {
        Notification::Message { id, .. }
        | Notification::GroupSummary { id, .. }
        | Notification::RetireGroup { id, .. }
        | Notification::Cancel { id, .. }
        | Notification::AccountError { id, .. }
        | Notification::LoggedOut { id, .. } => Some(*id),
        Notification::ServiceError { .. } | Notification::Transient { .. } => None,
    };
    if let (Some(id), Some(map)) = (id, value.as_object_mut()) {
        map.insert("id".to_string(), json!(id));
    }
    value
}
