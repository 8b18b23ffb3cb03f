//! Ref update descriptions produced by a git push.

use serde::{Deserialize, Serialize};

use crate::queue::Task;

/// Object id marking a ref that does not exist on one side of the update.
pub const EMPTY_SHA: &str = "0000000000000000000000000000000000000000";

/// Prefix of branch refs.
pub const BRANCH_PREFIX: &str = "refs/heads/";

/// Prefix of tag refs.
pub const TAG_PREFIX: &str = "refs/tags/";

/// What kind of ref an update touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefKind {
    Branch,
    Tag,
    Other,
}

impl std::fmt::Display for RefKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefKind::Branch => write!(f, "branch"),
            RefKind::Tag => write!(f, "tag"),
            RefKind::Other => write!(f, "other"),
        }
    }
}

/// One ref update of a push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushUpdateOptions {
    pub pusher_id: i64,
    pub pusher_name: String,
    pub repo_user_name: String,
    pub repo_name: String,
    pub ref_full_name: String,
    pub old_commit_id: String,
    pub new_commit_id: String,
}

impl Task for PushUpdateOptions {}

impl PushUpdateOptions {
    /// Builds an update of `ref_full_name` in `owner/name` from `old` to `new`.
    pub fn new(
        repo_user_name: impl Into<String>,
        repo_name: impl Into<String>,
        ref_full_name: impl Into<String>,
        old_commit_id: impl Into<String>,
        new_commit_id: impl Into<String>,
    ) -> Self {
        Self {
            pusher_id: 0,
            pusher_name: String::new(),
            repo_user_name: repo_user_name.into(),
            repo_name: repo_name.into(),
            ref_full_name: ref_full_name.into(),
            old_commit_id: old_commit_id.into(),
            new_commit_id: new_commit_id.into(),
        }
    }

    pub fn with_pusher(mut self, id: i64, name: impl Into<String>) -> Self {
        self.pusher_id = id;
        self.pusher_name = name.into();
        self
    }

    /// The ref did not exist before the push.
    pub fn is_new_ref(&self) -> bool {
        self.old_commit_id == EMPTY_SHA
    }

    /// The push deleted the ref.
    pub fn is_del_ref(&self) -> bool {
        self.new_commit_id == EMPTY_SHA
    }

    /// The ref existed before and after the push.
    pub fn is_update_ref(&self) -> bool {
        !self.is_new_ref() && !self.is_del_ref()
    }

    pub fn is_tag(&self) -> bool {
        self.ref_full_name.starts_with(TAG_PREFIX)
    }

    pub fn is_new_tag(&self) -> bool {
        self.is_tag() && self.is_new_ref()
    }

    pub fn is_del_tag(&self) -> bool {
        self.is_tag() && self.is_del_ref()
    }

    pub fn is_branch(&self) -> bool {
        self.ref_full_name.starts_with(BRANCH_PREFIX)
    }

    pub fn is_new_branch(&self) -> bool {
        self.is_branch() && self.is_new_ref()
    }

    pub fn is_update_branch(&self) -> bool {
        self.is_branch() && self.is_update_ref()
    }

    pub fn is_del_branch(&self) -> bool {
        self.is_branch() && self.is_del_ref()
    }

    pub fn ref_kind(&self) -> RefKind {
        if self.is_branch() {
            RefKind::Branch
        } else if self.is_tag() {
            RefKind::Tag
        } else {
            RefKind::Other
        }
    }

    /// Tag name without the `refs/tags/` prefix.
    pub fn tag_name(&self) -> &str {
        self.ref_full_name
            .strip_prefix(TAG_PREFIX)
            .unwrap_or(&self.ref_full_name)
    }

    /// Branch name without the `refs/heads/` prefix.
    pub fn branch_name(&self) -> &str {
        self.ref_full_name
            .strip_prefix(BRANCH_PREFIX)
            .unwrap_or(&self.ref_full_name)
    }

    /// Short ref name: branch or tag name, or the full name otherwise.
    pub fn ref_name(&self) -> &str {
        match self.ref_kind() {
            RefKind::Branch => self.branch_name(),
            RefKind::Tag => self.tag_name(),
            RefKind::Other => &self.ref_full_name,
        }
    }

    /// `owner/name` of the pushed repository.
    pub fn repo_full_name(&self) -> String {
        format!("{}/{}", self.repo_user_name, self.repo_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

    #[test]
    fn test_branch_update_classification() {
        let created = PushUpdateOptions::new("alice", "forge", "refs/heads/main", EMPTY_SHA, SHA);
        assert!(created.is_new_branch());
        assert!(!created.is_update_branch());
        assert_eq!(created.ref_kind(), RefKind::Branch);
        assert_eq!(created.ref_name(), "main");

        let updated = PushUpdateOptions::new("alice", "forge", "refs/heads/feature/x", SHA, SHA);
        assert!(updated.is_update_branch());
        assert_eq!(updated.branch_name(), "feature/x");

        let deleted = PushUpdateOptions::new("alice", "forge", "refs/heads/old", SHA, EMPTY_SHA);
        assert!(deleted.is_del_branch());
        assert_eq!(deleted.repo_full_name(), "alice/forge");
    }

    #[test]
    fn test_tag_and_other_refs() {
        let tag = PushUpdateOptions::new("alice", "forge", "refs/tags/v1.0.0", EMPTY_SHA, SHA);
        assert!(tag.is_new_tag());
        assert!(!tag.is_branch());
        assert_eq!(tag.tag_name(), "v1.0.0");

        let gone = PushUpdateOptions::new("alice", "forge", "refs/tags/v0.9", SHA, EMPTY_SHA);
        assert!(gone.is_del_tag());

        let note = PushUpdateOptions::new("alice", "forge", "refs/notes/commits", SHA, SHA);
        assert_eq!(note.ref_kind(), RefKind::Other);
        assert_eq!(note.ref_name(), "refs/notes/commits");
    }

    #[test]
    fn test_options_have_no_identity() {
        let opts = PushUpdateOptions::new("a", "b", "refs/heads/main", SHA, SHA).with_pusher(7, "bob");
        assert!(opts.identity().is_none());
        assert_eq!(opts.pusher_id, 7);
    }
}
