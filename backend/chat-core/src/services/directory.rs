use crate::error::AppResult;
use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

/// Identity/profile lookups the core needs from the user service
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn user_exists(&self, user_id: Uuid) -> AppResult<bool>;

    async fn display_name(&self, user_id: Uuid) -> AppResult<Option<String>>;

    /// Ids from `user_ids` that do not exist
    async fn missing_users(&self, user_ids: &[Uuid]) -> AppResult<Vec<Uuid>> {
        let mut missing = Vec::new();
        for &user_id in user_ids {
            if !self.user_exists(user_id).await? {
                missing.push(user_id);
            }
        }
        Ok(missing)
    }
}

/// Directory held in memory; registration is explicit
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    users: DashMap<Uuid, String>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, user_id: Uuid, display_name: impl Into<String>) {
        self.users.insert(user_id, display_name.into());
    }
}

#[async_trait]
impl UserDirectory for InMemoryDirectory {
    async fn user_exists(&self, user_id: Uuid) -> AppResult<bool> {
        Ok(self.users.contains_key(&user_id))
    }

    async fn display_name(&self, user_id: Uuid) -> AppResult<Option<String>> {
        Ok(self.users.get(&user_id).map(|name| name.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_users() {
        let directory = InMemoryDirectory::new();
        let known = Uuid::new_v4();
        let unknown = Uuid::new_v4();
        directory.register(known, "Known");

        assert_eq!(
            directory.missing_users(&[known, unknown]).await.unwrap(),
            vec![unknown]
        );
        assert_eq!(
            directory.display_name(known).await.unwrap().as_deref(),
            Some("Known")
        );
    }
}
