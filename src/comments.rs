//! Threaded comments.
//!
//! Comments are stored flat with an optional `parent_id`; this module turns
//! them into a tree of [`CommentNode`]s and keeps that tree consistent while
//! it is mutated optimistically. A node always sits under the node whose id is
//! its `parent_id`, and removing a node takes its whole subtree with it.
//!
//! Nodes created locally before the server has stored them are *pending*.
//! They carry a temporary id from a separate namespace (see [`NodeKey`]) and
//! are swapped for the stored comment on [`CommentThread::confirm`] or
//! dropped on [`CommentThread::rollback`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use thiserror::Error;

use crate::models::Comment;

/// Deepest allowed reply chain; a root comment is at depth 1.
pub const MAX_THREAD_DEPTH: usize = 32;

/// Most root comments served in one listing page.
pub const MAX_COMMENT_PAGE: usize = 200;

/// Identifies a node in a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKey {
    /// A comment the server has stored, by its id
    Saved(u64),
    /// A locally created comment awaiting confirmation, by temporary id
    Pending(u64),
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKey::Saved(id) => write!(f, "comment {}", id),
            NodeKey::Pending(id) => write!(f, "pending comment {}", id),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ThreadError {
    #[error("parent comment {0} is not in this thread")]
    UnknownParent(u64),

    #[error("{0} not found")]
    NotFound(NodeKey),

    #[error("{0} is not pending")]
    NotPending(NodeKey),

    #[error("confirmed comment belongs to report {found}, expected {expected}")]
    WrongReport { expected: u64, found: u64 },

    #[error("confirmed comment has parent {found:?}, expected {expected:?}")]
    WrongParent {
        expected: Option<u64>,
        found: Option<u64>,
    },

    #[error("comment {0} is nested too deeply to reply to")]
    TooDeep(u64),
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// A comment with its replies, as rendered to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentNode {
    pub id: u64,
    pub content: String,
    pub report_id: u64,
    pub parent_id: Option<u64>,
    pub user_id: u64,
    /// Author's username, empty when the author no longer exists
    #[serde(default)]
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub pending: bool,
    #[serde(default)]
    pub replies: Vec<CommentNode>,
}

impl CommentNode {
    pub fn from_comment(comment: &Comment, username: &str) -> Self {
        CommentNode {
            id: comment.id,
            content: comment.content.clone(),
            report_id: comment.report_id,
            parent_id: comment.parent_id,
            user_id: comment.user_id,
            username: username.to_string(),
            created_at: comment.created_at,
            updated_at: comment.updated_at,
            pending: false,
            replies: Vec::new(),
        }
    }

    pub fn key(&self) -> NodeKey {
        if self.pending {
            NodeKey::Pending(self.id)
        } else {
            NodeKey::Saved(self.id)
        }
    }

    /// Number of nodes in this subtree, the node included.
    pub fn count(&self) -> usize {
        1 + self.replies.iter().map(CommentNode::count).sum::<usize>()
    }

    fn depth(&self) -> usize {
        1 + self.replies.iter().map(CommentNode::depth).max().unwrap_or(0)
    }

    fn collect_saved_ids(&self, out: &mut Vec<u64>) {
        if !self.pending {
            out.push(self.id);
        }
        for reply in &self.replies {
            reply.collect_saved_ids(out);
        }
    }
}

/// Build a forest from a flat list of comments.
///
/// A comment whose parent is missing from `comments` becomes a root. A parent
/// is only honoured when its id is lower than the child's; the store hands
/// out ids in creation order, so this rules out cycles in corrupt input.
/// Siblings are ordered oldest first, ties broken by id.
pub fn build_forest(comments: &[Comment], usernames: &HashMap<u64, String>) -> Vec<CommentNode> {
    let ids: HashSet<u64> = comments.iter().map(|c| c.id).collect();

    let mut children: HashMap<Option<u64>, Vec<&Comment>> = HashMap::new();
    for comment in comments {
        let parent = comment
            .parent_id
            .filter(|p| *p < comment.id && ids.contains(p));
        children.entry(parent).or_default().push(comment);
    }
    for siblings in children.values_mut() {
        siblings.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    }

    attach(None, &children, usernames)
}

fn attach(
    parent: Option<u64>,
    children: &HashMap<Option<u64>, Vec<&Comment>>,
    usernames: &HashMap<u64, String>,
) -> Vec<CommentNode> {
    let Some(siblings) = children.get(&parent) else {
        return Vec::new();
    };
    siblings
        .iter()
        .map(|comment| {
            let name = usernames
                .get(&comment.user_id)
                .map(String::as_str)
                .unwrap_or("");
            let mut node = CommentNode::from_comment(comment, name);
            node.replies = attach(Some(comment.id), children, usernames);
            node
        })
        .collect()
}

fn find_in(nodes: &[CommentNode], key: NodeKey) -> Option<&CommentNode> {
    for node in nodes {
        if node.key() == key {
            return Some(node);
        }
        if let Some(found) = find_in(&node.replies, key) {
            return Some(found);
        }
    }
    None
}

/// Depth of the node with `key`, counting `level` for the nodes in `nodes`.
fn depth_of(nodes: &[CommentNode], key: NodeKey, level: usize) -> Option<usize> {
    for node in nodes {
        if node.key() == key {
            return Some(level);
        }
        if let Some(depth) = depth_of(&node.replies, key, level + 1) {
            return Some(depth);
        }
    }
    None
}

fn find_in_mut(nodes: &mut [CommentNode], key: NodeKey) -> Option<&mut CommentNode> {
    for node in nodes.iter_mut() {
        if node.key() == key {
            return Some(node);
        }
        if let Some(found) = find_in_mut(&mut node.replies, key) {
            return Some(found);
        }
    }
    None
}

/// Remove the node with `key` from wherever it sits. Returns the node and the
/// position it was taken from.
fn take_from(
    nodes: &mut Vec<CommentNode>,
    parent: Option<NodeKey>,
    key: NodeKey,
) -> Option<Detached> {
    if let Some(index) = nodes.iter().position(|n| n.key() == key) {
        let node = nodes.remove(index);
        return Some(Detached {
            parent,
            index,
            node,
        });
    }
    for node in nodes.iter_mut() {
        let here = node.key();
        if let Some(found) = take_from(&mut node.replies, Some(here), key) {
            return Some(found);
        }
    }
    None
}

/// A subtree cut out of a thread, with enough context to put it back.
#[derive(Debug, Clone, PartialEq)]
pub struct Detached {
    pub parent: Option<NodeKey>,
    pub index: usize,
    pub node: CommentNode,
}

/// Content of a node before an edit, for reverting.
#[derive(Debug, Clone, PartialEq)]
pub struct PreviousContent {
    pub content: String,
    pub updated_at: Option<DateTime<Utc>>,
}

/// The comment tree of one report.
#[derive(Debug, Clone, Default)]
pub struct CommentThread {
    report_id: u64,
    roots: Vec<CommentNode>,
    next_pending: u64,
}

impl CommentThread {
    pub fn new(report_id: u64) -> Self {
        CommentThread {
            report_id,
            roots: Vec::new(),
            next_pending: 1,
        }
    }

    pub fn from_comments(
        report_id: u64,
        comments: &[Comment],
        usernames: &HashMap<u64, String>,
    ) -> Self {
        let own: Vec<Comment> = comments
            .iter()
            .filter(|c| c.report_id == report_id)
            .cloned()
            .collect();
        CommentThread {
            report_id,
            roots: build_forest(&own, usernames),
            next_pending: 1,
        }
    }

    /// Adopt an already-built forest, e.g. one returned by the API.
    pub fn from_nodes(report_id: u64, roots: Vec<CommentNode>) -> Self {
        CommentThread {
            report_id,
            roots,
            next_pending: 1,
        }
    }

    pub fn report_id(&self) -> u64 {
        self.report_id
    }

    pub fn roots(&self) -> &[CommentNode] {
        &self.roots
    }

    pub fn into_roots(self) -> Vec<CommentNode> {
        self.roots
    }

    pub fn find(&self, key: NodeKey) -> Option<&CommentNode> {
        find_in(&self.roots, key)
    }

    pub fn contains(&self, key: NodeKey) -> bool {
        self.find(key).is_some()
    }

    /// Total number of comments, replies included.
    pub fn len(&self) -> usize {
        self.roots.iter().map(CommentNode::count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Length of the longest root-to-leaf chain; 0 for an empty thread.
    pub fn depth(&self) -> usize {
        self.roots.iter().map(CommentNode::depth).max().unwrap_or(0)
    }

    /// Append a pending comment as the last reply to `parent`, or as the last
    /// root when `parent` is `None`.
    ///
    /// Replies can only target stored comments, since the server needs a
    /// real parent id, and may not go deeper than [`MAX_THREAD_DEPTH`].
    pub fn insert_optimistic(
        &mut self,
        parent: Option<u64>,
        user_id: u64,
        username: &str,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<NodeKey, ThreadError> {
        let temp_id = self.next_pending;
        let node = CommentNode {
            id: temp_id,
            content: content.to_string(),
            report_id: self.report_id,
            parent_id: parent,
            user_id,
            username: username.to_string(),
            created_at: now,
            updated_at: None,
            pending: true,
            replies: Vec::new(),
        };

        match parent {
            None => self.roots.push(node),
            Some(parent_id) => {
                let parent_key = NodeKey::Saved(parent_id);
                let depth = depth_of(&self.roots, parent_key, 1)
                    .ok_or(ThreadError::UnknownParent(parent_id))?;
                if depth >= MAX_THREAD_DEPTH {
                    return Err(ThreadError::TooDeep(parent_id));
                }
                let parent_node = find_in_mut(&mut self.roots, parent_key)
                    .ok_or(ThreadError::UnknownParent(parent_id))?;
                parent_node.replies.push(node);
            }
        }

        self.next_pending += 1;
        Ok(NodeKey::Pending(temp_id))
    }

    /// Swap a pending node for the stored comment, in place.
    pub fn confirm(&mut self, key: NodeKey, saved: CommentNode) -> Result<(), ThreadError> {
        if !matches!(key, NodeKey::Pending(_)) {
            return Err(ThreadError::NotPending(key));
        }
        if saved.report_id != self.report_id {
            return Err(ThreadError::WrongReport {
                expected: self.report_id,
                found: saved.report_id,
            });
        }
        let node = find_in_mut(&mut self.roots, key).ok_or(ThreadError::NotFound(key))?;
        if node.parent_id != saved.parent_id {
            return Err(ThreadError::WrongParent {
                expected: node.parent_id,
                found: saved.parent_id,
            });
        }

        let replies = std::mem::take(&mut node.replies);
        *node = saved;
        node.pending = false;
        node.replies.extend(replies);
        Ok(())
    }

    /// Drop a pending node that the server refused.
    pub fn rollback(&mut self, key: NodeKey) -> Result<CommentNode, ThreadError> {
        if !matches!(key, NodeKey::Pending(_)) {
            return Err(ThreadError::NotPending(key));
        }
        take_from(&mut self.roots, None, key)
            .map(|d| d.node)
            .ok_or(ThreadError::NotFound(key))
    }

    /// Replace the content of a node and return what it held before.
    pub fn edit(
        &mut self,
        key: NodeKey,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<PreviousContent, ThreadError> {
        let node = find_in_mut(&mut self.roots, key).ok_or(ThreadError::NotFound(key))?;
        let previous = PreviousContent {
            content: std::mem::replace(&mut node.content, content.to_string()),
            updated_at: node.updated_at,
        };
        if !node.pending {
            node.updated_at = Some(now);
        }
        Ok(previous)
    }

    /// Put back content saved by [`CommentThread::edit`].
    pub fn restore_content(
        &mut self,
        key: NodeKey,
        previous: PreviousContent,
    ) -> Result<(), ThreadError> {
        let node = find_in_mut(&mut self.roots, key).ok_or(ThreadError::NotFound(key))?;
        node.content = previous.content;
        node.updated_at = previous.updated_at;
        Ok(())
    }

    /// Cut a node and all of its replies out of the thread.
    pub fn remove(&mut self, key: NodeKey) -> Option<Detached> {
        take_from(&mut self.roots, None, key)
    }

    /// Put a subtree cut out by [`CommentThread::remove`] back where it was.
    pub fn reattach(&mut self, detached: Detached) -> Result<(), ThreadError> {
        let siblings = match detached.parent {
            None => &mut self.roots,
            Some(parent) => {
                &mut find_in_mut(&mut self.roots, parent)
                    .ok_or(ThreadError::NotFound(parent))?
                    .replies
            }
        };
        let index = detached.index.min(siblings.len());
        siblings.insert(index, detached.node);
        Ok(())
    }

    /// Ids of every stored comment in the subtree rooted at `key`, root first.
    pub fn subtree_ids(&self, key: NodeKey) -> Vec<u64> {
        let mut ids = Vec::new();
        if let Some(node) = self.find(key) {
            node.collect_saved_ids(&mut ids);
        }
        ids
    }

    /// Page over top-level comments; replies come along with their root.
    pub fn paginate_roots(self, skip: usize, limit: usize) -> Vec<CommentNode> {
        self.roots.into_iter().skip(skip).take(limit).collect()
    }
}

// Web handler functions below (only compiled with "web" feature)

#[cfg(feature = "web")]
pub use handlers::*;

#[cfg(feature = "web")]
mod handlers {
    use axum::{
        Extension, Json,
        extract::{Path, Query, State},
    };
    use chrono::Utc;
    use serde::Deserialize;

    use super::{CommentNode, MAX_COMMENT_PAGE};
    use crate::app::SharedState;
    use crate::error::AppError;
    use crate::login::AuthUser;
    use crate::mentions::extract_mentions;
    use crate::store::MentionSource;

    const DEFAULT_COMMENT_PAGE: usize = 50;

    #[derive(Debug, Deserialize)]
    pub struct CommentPageQuery {
        #[serde(default)]
        pub skip: usize,
        pub limit: Option<usize>,
    }

    #[derive(Debug, Deserialize)]
    pub struct CreateCommentRequest {
        pub content: String,
        pub report_id: u64,
        #[serde(default)]
        pub parent_id: Option<u64>,
    }

    #[derive(Debug, Deserialize)]
    pub struct UpdateCommentRequest {
        pub content: String,
    }

    fn require_content(content: &str) -> Result<(), AppError> {
        if content.trim().is_empty() {
            return Err(AppError::bad_request("Comment content cannot be empty"));
        }
        Ok(())
    }

    /// List the comment tree of a report, paginated over top-level comments.
    pub async fn list_comments(
        State(state): State<SharedState>,
        Extension(auth): Extension<AuthUser>,
        Path(report_id): Path<u64>,
        Query(page): Query<CommentPageQuery>,
    ) -> Result<Json<Vec<CommentNode>>, AppError> {
        let limit = page
            .limit
            .unwrap_or(DEFAULT_COMMENT_PAGE)
            .clamp(1, MAX_COMMENT_PAGE);

        let thread = state.store.read(|db| {
            db.visible_report(&auth.user, report_id)?;
            Ok::<_, AppError>(db.comment_thread(report_id))
        })??;

        Ok(Json(thread.paginate_roots(page.skip, limit)))
    }

    /// Post a comment or a reply.
    pub async fn create_comment(
        State(state): State<SharedState>,
        Extension(auth): Extension<AuthUser>,
        Json(req): Json<CreateCommentRequest>,
    ) -> Result<Json<CommentNode>, AppError> {
        require_content(&req.content)?;
        let now = Utc::now();

        let comment = state.store.write(|db| {
            db.visible_report(&auth.user, req.report_id)?;
            let comment =
                db.add_comment(req.report_id, auth.user.id, req.parent_id, &req.content, now)?;
            db.replace_mentions(
                MentionSource::Comment {
                    report_id: comment.report_id,
                    comment_id: comment.id,
                },
                &extract_mentions(&comment.content),
                now,
            );
            Ok(comment)
        })?;

        log::info!(
            "user {} commented {} on report {}",
            auth.user.username,
            comment.id,
            comment.report_id
        );
        Ok(Json(CommentNode::from_comment(&comment, &auth.user.username)))
    }

    /// Edit a comment. Only its author may do this.
    pub async fn update_comment(
        State(state): State<SharedState>,
        Extension(auth): Extension<AuthUser>,
        Path(comment_id): Path<u64>,
        Json(req): Json<UpdateCommentRequest>,
    ) -> Result<Json<CommentNode>, AppError> {
        require_content(&req.content)?;
        let now = Utc::now();

        let comment = state.store.write(|db| {
            let existing = db
                .comment(comment_id)
                .ok_or_else(|| AppError::not_found("Comment not found"))?;
            if existing.user_id != auth.user.id {
                return Err(AppError::forbidden("Not enough permissions"));
            }
            let comment = db.update_comment(comment_id, &req.content, now)?;
            db.replace_mentions(
                MentionSource::Comment {
                    report_id: comment.report_id,
                    comment_id: comment.id,
                },
                &extract_mentions(&comment.content),
                now,
            );
            Ok(comment)
        })?;

        Ok(Json(CommentNode::from_comment(&comment, &auth.user.username)))
    }

    /// Delete a comment and its replies. Allowed for the author, the report
    /// owner and superusers.
    pub async fn delete_comment(
        State(state): State<SharedState>,
        Extension(auth): Extension<AuthUser>,
        Path(comment_id): Path<u64>,
    ) -> Result<Json<serde_json::Value>, AppError> {
        let removed = state.store.write(|db| {
            let comment = db
                .comment(comment_id)
                .ok_or_else(|| AppError::not_found("Comment not found"))?;
            let owns_report = db
                .report(comment.report_id)
                .is_some_and(|r| r.user_id == auth.user.id);
            if comment.user_id != auth.user.id && !owns_report && !auth.user.is_superuser {
                return Err(AppError::forbidden("Not enough permissions"));
            }
            db.delete_comment(comment_id)
        })?;

        log::info!(
            "user {} deleted comment {} ({} removed)",
            auth.user.username,
            comment_id,
            removed.len()
        );
        Ok(Json(serde_json::json!({
            "detail": "Comment deleted successfully",
            "deleted": removed,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn comment(id: u64, parent: Option<u64>, offset: i64) -> Comment {
        let base = DateTime::parse_from_rfc3339("2025-01-06T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        Comment {
            id,
            content: format!("comment {}", id),
            report_id: 7,
            user_id: 1,
            parent_id: parent,
            created_at: base + Duration::seconds(offset),
            updated_at: None,
        }
    }

    fn names() -> HashMap<u64, String> {
        HashMap::from([(1, "alice".to_string())])
    }

    fn sample_thread() -> CommentThread {
        // 1
        // ├── 3
        // │   └── 4
        // └── 5
        // 2
        let comments = vec![
            comment(1, None, 0),
            comment(2, None, 10),
            comment(3, Some(1), 20),
            comment(4, Some(3), 30),
            comment(5, Some(1), 40),
        ];
        CommentThread::from_comments(7, &comments, &names())
    }

    #[test]
    fn replies_nest_under_their_parents() {
        let thread = sample_thread();
        let roots = thread.roots();

        assert_eq!(roots.len(), 2);
        assert_eq!(roots[0].id, 1);
        assert_eq!(roots[0].username, "alice");
        assert_eq!(
            roots[0].replies.iter().map(|n| n.id).collect::<Vec<_>>(),
            vec![3, 5]
        );
        assert_eq!(roots[0].replies[0].replies[0].id, 4);
        assert_eq!(thread.len(), 5);
        assert_eq!(thread.depth(), 3);
        println!("✓ Flat comments built into a nested tree");
    }

    #[test]
    fn siblings_are_ordered_by_time_not_input_order() {
        let comments = vec![comment(2, None, 50), comment(1, None, 0), comment(3, None, 50)];
        let forest = build_forest(&comments, &names());
        assert_eq!(forest.iter().map(|n| n.id).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn orphans_become_roots_and_cycles_are_broken() {
        let comments = vec![
            comment(10, Some(99), 0), // parent missing
            comment(11, Some(12), 5), // parent has a higher id
            comment(12, Some(11), 10),
        ];
        let forest = build_forest(&comments, &names());
        let root_ids: Vec<u64> = forest.iter().map(|n| n.id).collect();
        assert_eq!(root_ids, vec![10, 11]);
        assert_eq!(forest[1].replies[0].id, 12);
    }

    #[test]
    fn comments_from_other_reports_are_ignored() {
        let mut other = comment(9, None, 0);
        other.report_id = 8;
        let thread = CommentThread::from_comments(7, &[comment(1, None, 0), other], &names());
        assert_eq!(thread.len(), 1);
    }

    #[test]
    fn optimistic_reply_is_confirmed_in_place() {
        let mut thread = sample_thread();
        let now = Utc::now();

        let key = thread
            .insert_optimistic(Some(1), 1, "alice", "draft", now)
            .unwrap();
        assert!(matches!(key, NodeKey::Pending(_)));
        let pending = thread.find(key).unwrap();
        assert!(pending.pending);
        assert_eq!(pending.parent_id, Some(1));
        assert_eq!(thread.roots()[0].replies.len(), 3);

        let mut saved = CommentNode::from_comment(&comment(6, Some(1), 60), "alice");
        saved.content = "draft".to_string();
        thread.confirm(key, saved).unwrap();

        assert!(!thread.contains(key));
        let confirmed = thread.find(NodeKey::Saved(6)).unwrap();
        assert!(!confirmed.pending);
        assert_eq!(thread.roots()[0].replies[2].id, 6);
        println!("✓ Pending reply swapped for the stored comment in place");
    }

    #[test]
    fn pending_ids_do_not_collide_with_saved_ids() {
        let mut thread = sample_thread();
        let key = thread.insert_optimistic(None, 1, "alice", "x", Utc::now()).unwrap();
        assert_eq!(key, NodeKey::Pending(1));
        // Saved comment 1 is still found separately.
        assert_eq!(thread.find(NodeKey::Saved(1)).unwrap().content, "comment 1");
        assert_eq!(thread.find(key).unwrap().content, "x");
    }

    #[test]
    fn replying_to_unknown_or_pending_parent_fails() {
        let mut thread = sample_thread();
        assert_eq!(
            thread.insert_optimistic(Some(42), 1, "alice", "x", Utc::now()),
            Err(ThreadError::UnknownParent(42))
        );

        let pending = thread.insert_optimistic(None, 1, "alice", "x", Utc::now()).unwrap();
        let NodeKey::Pending(temp) = pending else {
            panic!("expected a pending key");
        };
        // A pending id used as a parent is looked up as a saved id.
        assert!(thread.insert_optimistic(Some(temp + 100), 1, "alice", "y", Utc::now()).is_err());
    }

    #[test]
    fn rollback_removes_only_the_pending_node() {
        let mut thread = sample_thread();
        let before = thread.len();
        let key = thread
            .insert_optimistic(Some(3), 1, "alice", "oops", Utc::now())
            .unwrap();
        assert_eq!(thread.len(), before + 1);

        let dropped = thread.rollback(key).unwrap();
        assert_eq!(dropped.content, "oops");
        assert_eq!(thread.len(), before);
        assert_eq!(
            thread.rollback(NodeKey::Saved(3)),
            Err(ThreadError::NotPending(NodeKey::Saved(3)))
        );
    }

    #[test]
    fn confirm_rejects_saved_keys_and_foreign_reports() {
        let mut thread = sample_thread();
        let key = thread.insert_optimistic(None, 1, "alice", "x", Utc::now()).unwrap();

        let mut foreign = CommentNode::from_comment(&comment(6, None, 0), "alice");
        foreign.report_id = 99;
        assert!(matches!(
            thread.confirm(key, foreign),
            Err(ThreadError::WrongReport { .. })
        ));

        let saved = CommentNode::from_comment(&comment(6, None, 0), "alice");
        assert_eq!(
            thread.confirm(NodeKey::Saved(1), saved),
            Err(ThreadError::NotPending(NodeKey::Saved(1)))
        );
    }

    #[test]
    fn confirm_rejects_a_different_parent() {
        let mut thread = sample_thread();
        let key = thread
            .insert_optimistic(Some(1), 1, "alice", "x", Utc::now())
            .unwrap();

        let moved = CommentNode::from_comment(&comment(6, Some(3), 0), "alice");
        assert_eq!(
            thread.confirm(key, moved),
            Err(ThreadError::WrongParent {
                expected: Some(1),
                found: Some(3),
            })
        );
        assert!(thread.find(key).unwrap().pending);
        assert_eq!(thread.find(NodeKey::Saved(3)).unwrap().replies.len(), 1);
    }

    #[test]
    fn confirming_an_earlier_sibling_keeps_every_position() {
        let mut thread = sample_thread();
        let now = Utc::now();
        let first = thread.insert_optimistic(Some(1), 1, "alice", "a", now).unwrap();
        let second = thread.insert_optimistic(Some(1), 1, "alice", "b", now).unwrap();

        // The first draft is confirmed while the second is still pending.
        let saved = CommentNode::from_comment(&comment(6, Some(1), 60), "alice");
        thread.confirm(first, saved).unwrap();

        let replies = &thread.roots()[0].replies;
        assert_eq!(
            replies.iter().map(|n| n.key()).collect::<Vec<_>>(),
            vec![NodeKey::Saved(3), NodeKey::Saved(5), NodeKey::Saved(6), second]
        );
        assert_eq!(replies[3].content, "b");
        println!("✓ Confirming a middle sibling leaves its neighbours in place");
    }

    /// A single chain of `len` comments, each replying to the previous one.
    fn chain(len: u64) -> Vec<Comment> {
        (1..=len)
            .map(|id| comment(id, if id == 1 { None } else { Some(id - 1) }, id as i64))
            .collect()
    }

    #[test]
    fn replies_stop_at_the_depth_limit() {
        let limit = MAX_THREAD_DEPTH as u64;
        let mut thread = CommentThread::from_comments(7, &chain(limit), &names());
        assert_eq!(thread.depth(), MAX_THREAD_DEPTH);

        assert_eq!(
            thread.insert_optimistic(Some(limit), 1, "alice", "too deep", Utc::now()),
            Err(ThreadError::TooDeep(limit))
        );
        assert_eq!(thread.len(), MAX_THREAD_DEPTH);

        let key = thread
            .insert_optimistic(Some(limit - 1), 1, "alice", "fits", Utc::now())
            .unwrap();
        assert!(thread.contains(key));
    }

    #[test]
    fn deepest_thread_survives_json() {
        let thread =
            CommentThread::from_comments(7, &chain(MAX_THREAD_DEPTH as u64), &names());
        let json = serde_json::to_string(&thread.paginate_roots(0, 50)).unwrap();

        let roots: Vec<CommentNode> = serde_json::from_str(&json).unwrap();
        let decoded = CommentThread::from_nodes(7, roots);
        assert_eq!(decoded.depth(), MAX_THREAD_DEPTH);
        assert_eq!(decoded.len(), MAX_THREAD_DEPTH);
    }

    #[test]
    fn edit_can_be_reverted() {
        let mut thread = sample_thread();
        let key = NodeKey::Saved(4);
        let previous = thread.edit(key, "changed", Utc::now()).unwrap();
        assert_eq!(thread.find(key).unwrap().content, "changed");
        assert!(thread.find(key).unwrap().updated_at.is_some());

        thread.restore_content(key, previous).unwrap();
        let node = thread.find(key).unwrap();
        assert_eq!(node.content, "comment 4");
        assert!(node.updated_at.is_none());
    }

    #[test]
    fn remove_takes_the_subtree_and_reattach_restores_it() {
        let mut thread = sample_thread();
        let original = thread.roots().to_vec();

        assert_eq!(thread.subtree_ids(NodeKey::Saved(3)), vec![3, 4]);
        let detached = thread.remove(NodeKey::Saved(3)).unwrap();
        assert_eq!(detached.parent, Some(NodeKey::Saved(1)));
        assert_eq!(detached.index, 0);
        assert!(!thread.contains(NodeKey::Saved(4)));
        assert_eq!(thread.len(), 3);

        thread.reattach(detached).unwrap();
        assert_eq!(thread.roots(), original.as_slice());
        println!("✓ Removed subtree restored at its original position");
    }

    #[test]
    fn subtree_ids_skip_pending_nodes() {
        let mut thread = sample_thread();
        thread.insert_optimistic(Some(1), 1, "alice", "p", Utc::now()).unwrap();
        let mut ids = thread.subtree_ids(NodeKey::Saved(1));
        ids.sort();
        assert_eq!(ids, vec![1, 3, 4, 5]);
        assert!(thread.subtree_ids(NodeKey::Saved(77)).is_empty());
    }

    #[test]
    fn pagination_is_over_roots() {
        let page = sample_thread().paginate_roots(0, 1);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].count(), 4);

        let rest = sample_thread().paginate_roots(1, 10);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, 2);
    }

    #[test]
    fn pending_flag_is_only_serialized_when_set() {
        let thread = sample_thread();
        let json = serde_json::to_value(&thread.roots()[1]).unwrap();
        assert!(json.get("pending").is_none());
        assert_eq!(json["username"], "alice");
    }
}
