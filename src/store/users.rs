//! User records as the engine sees them: identity, default-model preference,
//! and the notification settings block. Deserialization is lenient since the
//! settings object is user-editable and grows fields the engine ignores.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// `ui.notifications.ntfy` settings block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NtfySettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub server_url: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl NtfySettings {
    /// Usable only when enabled and both endpoint parts are present.
    pub fn is_configured(&self) -> bool {
        self.enabled && !self.server_url.trim().is_empty() && !self.topic.trim().is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ntfy: Option<NtfySettings>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UiSettings {
    #[serde(default)]
    pub notifications: NotificationSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserSettings {
    /// Default-model preference order used when a job's model is unknown.
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub ui: UiSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub settings: UserSettings,
}

impl User {
    pub fn ntfy(&self) -> Option<&NtfySettings> {
        self.settings.ui.notifications.ntfy.as_ref()
    }
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<User>>;
}

/// Read-only snapshot of the user table, loaded from a JSON file at startup.
pub struct FileUserStore {
    users: HashMap<String, User>,
}

impl FileUserStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        let users: Vec<User> = if path.exists() {
            serde_json::from_str(&std::fs::read_to_string(&path)?)?
        } else {
            vec![]
        };
        Ok(Self {
            users: users.into_iter().map(|u| (u.id.clone(), u)).collect(),
        })
    }

    pub fn from_users(users: Vec<User>) -> Self {
        Self {
            users: users.into_iter().map(|u| (u.id.clone(), u)).collect(),
        }
    }
}

#[async_trait]
impl UserStore for FileUserStore {
    async fn get(&self, id: &str) -> Result<Option<User>> {
        Ok(self.users.get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_parse_leniently() {
        let raw = r#"{
            "id": "u1",
            "name": "Ada",
            "settings": {
                "models": ["gpt-x"],
                "theme": "dark",
                "ui": {
                    "notifications": {
                        "ntfy": {
                            "enabled": true,
                            "server_url": "https://ntfy.sh",
                            "topic": "mine",
                            "token": "secret"
                        }
                    }
                }
            }
        }"#;
        let user: User = serde_json::from_str(raw).unwrap();
        assert_eq!(user.settings.models, vec!["gpt-x"]);
        let ntfy = user.ntfy().unwrap();
        assert!(ntfy.is_configured());
        assert_eq!(ntfy.token.as_deref(), Some("secret"));
    }

    #[test]
    fn test_missing_settings_default() {
        let user: User = serde_json::from_str(r#"{"id": "u2"}"#).unwrap();
        assert!(user.settings.models.is_empty());
        assert!(user.ntfy().is_none());
    }

    #[test]
    fn test_ntfy_not_configured_without_topic() {
        let ntfy = NtfySettings {
            enabled: true,
            server_url: "https://ntfy.sh".to_string(),
            topic: String::new(),
            token: None,
        };
        assert!(!ntfy.is_configured());
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("users.json");
        let users = vec![User {
            id: "u1".to_string(),
            name: "Ada".to_string(),
            settings: UserSettings::default(),
        }];
        std::fs::write(&path, serde_json::to_string(&users).unwrap()).unwrap();

        let store = FileUserStore::open(path).unwrap();
        assert!(store.get("u1").await.unwrap().is_some());
        assert!(store.get("nope").await.unwrap().is_none());
    }
}
