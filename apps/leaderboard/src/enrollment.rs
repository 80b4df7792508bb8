use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::types::ContextRef;

/// Active member of a scope with the attributes used for partitioning and display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeMember {
    pub student_id: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub level: u32,
    #[serde(default)]
    pub achievements_count: u32,
}

impl ScopeMember {
    pub fn new(student_id: impl Into<String>) -> Self {
        Self {
            student_id: student_id.into(),
            attributes: BTreeMap::new(),
            level: 0,
            achievements_count: 0,
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum EnrollmentError {
    #[error("enrollment service unavailable: {0}")]
    Unavailable(String),
}

/// Scope membership source. `Ok(None)` means the context is unknown.
#[async_trait]
pub trait Enrollment: Send + Sync {
    async fn members(
        &self,
        context: &ContextRef,
    ) -> Result<Option<Vec<ScopeMember>>, EnrollmentError>;

    /// One member of the context, or `None` when the student or context is unknown.
    async fn member(
        &self,
        context: &ContextRef,
        student_id: &str,
    ) -> Result<Option<ScopeMember>, EnrollmentError> {
        Ok(self
            .members(context)
            .await?
            .and_then(|members| members.into_iter().find(|member| member.student_id == student_id)))
    }
}

/// In-process membership directory fed through the internal routes.
pub struct MembershipDirectory {
    contexts: RwLock<HashMap<ContextRef, BTreeMap<String, ScopeMember>>>,
    available: AtomicBool,
}

impl Default for MembershipDirectory {
    fn default() -> Self {
        Self {
            contexts: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl MembershipDirectory {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Adds or replaces a member. Returns true when the student was not enrolled before.
    pub async fn enroll(&self, context: &ContextRef, member: ScopeMember) -> bool {
        let mut contexts = self.contexts.write().await;
        contexts
            .entry(context.clone())
            .or_default()
            .insert(member.student_id.clone(), member)
            .is_none()
    }

    /// Removes a member. The context stays known even when it becomes empty.
    pub async fn unenroll(&self, context: &ContextRef, student_id: &str) -> bool {
        let mut contexts = self.contexts.write().await;
        contexts
            .get_mut(context)
            .and_then(|members| members.remove(student_id))
            .is_some()
    }

    fn check_available(&self) -> Result<(), EnrollmentError> {
        if self.available.load(Ordering::SeqCst) {
            return Ok(());
        }
        Err(EnrollmentError::Unavailable(
            "membership directory marked offline".to_string(),
        ))
    }
}

#[async_trait]
impl Enrollment for MembershipDirectory {
    async fn members(
        &self,
        context: &ContextRef,
    ) -> Result<Option<Vec<ScopeMember>>, EnrollmentError> {
        self.check_available()?;
        let contexts = self.contexts.read().await;
        Ok(contexts
            .get(context)
            .map(|members| members.values().cloned().collect()))
    }

    async fn member(
        &self,
        context: &ContextRef,
        student_id: &str,
    ) -> Result<Option<ScopeMember>, EnrollmentError> {
        self.check_available()?;
        let contexts = self.contexts.read().await;
        Ok(contexts
            .get(context)
            .and_then(|members| members.get(student_id))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ContextType;

    #[tokio::test]
    async fn unenrolled_context_stays_known() -> anyhow::Result<()> {
        let directory = MembershipDirectory::default();
        let class = ContextRef::new(ContextType::Class, "class-1");

        assert!(directory.members(&class).await?.is_none());
        assert!(directory.enroll(&class, ScopeMember::new("s1")).await);
        assert!(!directory.enroll(&class, ScopeMember::new("s1")).await);
        assert!(directory.unenroll(&class, "s1").await);
        assert!(!directory.unenroll(&class, "s1").await);

        let members = directory.members(&class).await?;
        assert_eq!(members.map(|members| members.len()), Some(0));
        Ok(())
    }

    #[tokio::test]
    async fn member_lookup_returns_attributes() -> anyhow::Result<()> {
        let directory = MembershipDirectory::default();
        let class = ContextRef::new(ContextType::Class, "class-1");
        directory
            .enroll(&class, ScopeMember::new("s1").with_attribute("cohort", "red"))
            .await;

        let member = directory.member(&class, "s1").await?;
        assert_eq!(member.as_ref().and_then(|m| m.attribute("cohort")), Some("red"));
        assert!(directory.member(&class, "s2").await?.is_none());

        directory.set_available(false);
        assert!(directory.member(&class, "s1").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn offline_directory_reports_unavailable() {
        let directory = MembershipDirectory::default();
        directory.set_available(false);
        let class = ContextRef::new(ContextType::Class, "class-1");
        assert!(matches!(
            directory.members(&class).await,
            Err(EnrollmentError::Unavailable(_))
        ));
    }
}
