//! In-memory database with snapshot persistence.
//!
//! All records live in one [`Database`] value behind a lock. [`Store::write`]
//! runs a mutation and, when it succeeds, snapshots the whole database to disk
//! through [`crate::saving`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::create_dir_all;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::comments::{CommentThread, MAX_THREAD_DEPTH, NodeKey};
use crate::error::AppError;
use crate::mentions;
use crate::models::{Attachment, Comment, Mention, Project, Report, User, UserRole};
use crate::reports::{self, Page};
use crate::saving::{self, SNAPSHOT_FILE};

/// Next identifier to hand out for each table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextIds {
    pub user: u64,
    pub report: u64,
    pub attachment: u64,
    pub comment: u64,
    pub mention: u64,
}

impl Default for NextIds {
    fn default() -> Self {
        NextIds {
            user: 1,
            report: 1,
            attachment: 1,
            comment: 1,
            mention: 1,
        }
    }
}

/// Fields needed to create a user. The password must already be hashed.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub password_hash: String,
    pub role: UserRole,
}

/// Admin-side changes to a user. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct UserChanges {
    pub email: Option<String>,
    pub full_name: Option<String>,
    pub role: Option<UserRole>,
    pub is_active: Option<bool>,
    /// Already hashed
    pub password_hash: Option<String>,
}

/// What a set of mentions is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MentionSource {
    Report(u64),
    Comment { report_id: u64, comment_id: u64 },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Database {
    users: BTreeMap<u64, User>,
    reports: BTreeMap<u64, Report>,
    attachments: BTreeMap<u64, Attachment>,
    comments: BTreeMap<u64, Comment>,
    mentions: BTreeMap<u64, Mention>,
    next_ids: NextIds,
}

impl Database {
    // ---- users ----

    /// Insert a new user.
    ///
    /// Usernames and emails are unique regardless of case. The very first
    /// account becomes the superuser so a fresh install can be administered.
    pub fn create_user(&mut self, new: NewUser, now: DateTime<Utc>) -> Result<User, AppError> {
        if self.user_by_username(&new.username).is_some() {
            return Err(AppError::Conflict("Username already exists".to_string()));
        }
        if self.user_by_email(&new.email).is_some() {
            return Err(AppError::Conflict(
                "A user with this email already exists".to_string(),
            ));
        }

        let first = self.users.is_empty();
        let id = self.next_ids.user;
        self.next_ids.user += 1;

        let user = User {
            id,
            username: new.username,
            email: new.email,
            full_name: new.full_name,
            password_hash: new.password_hash,
            role: if first { UserRole::Admin } else { new.role },
            projects: if first { Project::ALL.to_vec() } else { Vec::new() },
            is_active: true,
            is_superuser: first,
            created_at: now,
            reset_code: None,
            reset_code_expires: None,
        };
        self.users.insert(id, user.clone());
        Ok(user)
    }

    pub fn user(&self, id: u64) -> Option<&User> {
        self.users.get(&id)
    }

    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    pub fn user_by_username(&self, username: &str) -> Option<&User> {
        self.users
            .values()
            .find(|u| u.username.eq_ignore_ascii_case(username))
    }

    pub fn user_by_email(&self, email: &str) -> Option<&User> {
        self.users
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
    }

    /// Look a user up by username or email, as the login form allows both.
    pub fn user_by_login(&self, login: &str) -> Option<&User> {
        self.user_by_username(login)
            .or_else(|| self.user_by_email(login))
    }

    fn user_mut(&mut self, id: u64) -> Result<&mut User, AppError> {
        self.users
            .get_mut(&id)
            .ok_or_else(|| AppError::not_found("User not found"))
    }

    pub fn update_user(&mut self, id: u64, changes: UserChanges) -> Result<User, AppError> {
        if let Some(email) = &changes.email {
            if let Some(other) = self.user_by_email(email) {
                if other.id != id {
                    return Err(AppError::Conflict(
                        "A user with this email already exists".to_string(),
                    ));
                }
            }
        }

        let user = self.user_mut(id)?;
        if let Some(email) = changes.email {
            user.email = email;
        }
        if let Some(full_name) = changes.full_name {
            user.full_name = full_name;
        }
        if let Some(role) = changes.role {
            user.role = role;
        }
        if let Some(active) = changes.is_active {
            user.is_active = active;
        }
        if let Some(hash) = changes.password_hash {
            user.password_hash = hash;
            user.reset_code = None;
            user.reset_code_expires = None;
        }
        Ok(user.clone())
    }

    /// Replace a user's projects.
    ///
    /// Directors and superusers always get every project, whatever was asked for.
    pub fn assign_projects(&mut self, id: u64, projects: &[Project]) -> Result<User, AppError> {
        let user = self.user_mut(id)?;
        if user.is_superuser || user.role == UserRole::Director {
            user.projects = Project::ALL.to_vec();
        } else {
            let mut unique: Vec<Project> = projects.to_vec();
            unique.sort();
            unique.dedup();
            user.projects = unique;
        }
        Ok(user.clone())
    }

    pub fn set_reset_code(
        &mut self,
        id: u64,
        code: String,
        expires: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let user = self.user_mut(id)?;
        user.reset_code = Some(code);
        user.reset_code_expires = Some(expires);
        Ok(())
    }

    // ---- reports ----

    pub fn create_report(
        &mut self,
        user_id: u64,
        title: &str,
        content: &str,
        now: DateTime<Utc>,
    ) -> Report {
        let id = self.next_ids.report;
        self.next_ids.report += 1;

        let report = Report {
            id,
            title: title.trim().to_string(),
            content: content.to_string(),
            user_id,
            created_at: now,
            updated_at: None,
        };
        self.reports.insert(id, report.clone());
        report
    }

    pub fn report(&self, id: u64) -> Option<&Report> {
        self.reports.get(&id)
    }

    /// A user's own reports, newest first, filtered by title and paginated.
    pub fn list_reports(
        &self,
        user_id: u64,
        search: &str,
        skip: usize,
        limit: usize,
    ) -> Page<Report> {
        let mut items: Vec<Report> = self
            .reports
            .values()
            .filter(|r| r.user_id == user_id && reports::title_matches(&r.title, search))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        reports::paginate(items, skip, limit)
    }

    pub fn update_report(
        &mut self,
        id: u64,
        title: Option<&str>,
        content: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Report, AppError> {
        let report = self
            .reports
            .get_mut(&id)
            .ok_or_else(|| AppError::not_found("Report not found"))?;
        if let Some(title) = title {
            report.title = title.trim().to_string();
        }
        if let Some(content) = content {
            report.content = content.to_string();
        }
        report.updated_at = Some(now);
        Ok(report.clone())
    }

    /// Delete a report together with its comments, mentions and attachments.
    ///
    /// Returns the removed attachments so the caller can delete their files.
    pub fn delete_report(&mut self, id: u64) -> Result<Vec<Attachment>, AppError> {
        if self.reports.remove(&id).is_none() {
            return Err(AppError::not_found("Report not found"));
        }
        self.comments.retain(|_, c| c.report_id != id);
        self.mentions.retain(|_, m| m.report_id != id);

        let removed: Vec<Attachment> = self
            .attachments
            .values()
            .filter(|a| a.report_id == id)
            .cloned()
            .collect();
        self.attachments.retain(|_, a| a.report_id != id);
        Ok(removed)
    }

    /// Whether `user` may read `report`: owners, superusers, and anyone
    /// mentioned in the report or its comments.
    pub fn can_view_report(&self, user: &User, report: &Report) -> bool {
        report.user_id == user.id
            || user.is_superuser
            || self
                .mentions
                .values()
                .any(|m| m.report_id == report.id && m.user_id == user.id)
    }

    pub fn can_modify_report(&self, user: &User, report: &Report) -> bool {
        report.user_id == user.id || user.is_superuser
    }

    /// Fetch a report the user may read, with 404/403 as appropriate.
    pub fn visible_report(&self, user: &User, id: u64) -> Result<&Report, AppError> {
        let report = self
            .report(id)
            .ok_or_else(|| AppError::not_found("Report not found"))?;
        if !self.can_view_report(user, report) {
            return Err(AppError::forbidden("Not authorized to access this report"));
        }
        Ok(report)
    }

    /// Fetch a report the user may change, with 404/403 as appropriate.
    pub fn owned_report(&self, user: &User, id: u64) -> Result<&Report, AppError> {
        let report = self
            .report(id)
            .ok_or_else(|| AppError::not_found("Report not found"))?;
        if !self.can_modify_report(user, report) {
            return Err(AppError::forbidden("Not authorized to modify this report"));
        }
        Ok(report)
    }

    // ---- attachments ----

    pub fn add_attachment(
        &mut self,
        report_id: u64,
        filename: &str,
        file_path: &str,
        content_type: &str,
        size: u64,
        now: DateTime<Utc>,
    ) -> Result<Attachment, AppError> {
        if !self.reports.contains_key(&report_id) {
            return Err(AppError::not_found("Report not found"));
        }
        let id = self.next_ids.attachment;
        self.next_ids.attachment += 1;

        let attachment = Attachment {
            id,
            filename: filename.to_string(),
            file_path: file_path.to_string(),
            content_type: content_type.to_string(),
            size,
            report_id,
            created_at: now,
        };
        self.attachments.insert(id, attachment.clone());
        Ok(attachment)
    }

    pub fn attachment(&self, report_id: u64, id: u64) -> Option<&Attachment> {
        self.attachments
            .get(&id)
            .filter(|a| a.report_id == report_id)
    }

    pub fn attachments_for(&self, report_id: u64) -> Vec<Attachment> {
        self.attachments
            .values()
            .filter(|a| a.report_id == report_id)
            .cloned()
            .collect()
    }

    pub fn remove_attachment(&mut self, report_id: u64, id: u64) -> Result<Attachment, AppError> {
        if self.attachment(report_id, id).is_none() {
            return Err(AppError::not_found("Attachment not found"));
        }
        self.attachments
            .remove(&id)
            .ok_or_else(|| AppError::not_found("Attachment not found"))
    }

    // ---- comments ----

    /// Add a comment. A reply's parent must exist on the same report, and the
    /// reply may not nest deeper than [`MAX_THREAD_DEPTH`].
    pub fn add_comment(
        &mut self,
        report_id: u64,
        user_id: u64,
        parent_id: Option<u64>,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<Comment, AppError> {
        if !self.reports.contains_key(&report_id) {
            return Err(AppError::not_found("Report not found"));
        }
        if let Some(parent_id) = parent_id {
            match self.comments.get(&parent_id) {
                Some(parent) if parent.report_id == report_id => {
                    if self.comment_depth(parent_id) >= MAX_THREAD_DEPTH {
                        return Err(AppError::bad_request(format!(
                            "Replies cannot be nested more than {} levels deep",
                            MAX_THREAD_DEPTH
                        )));
                    }
                }
                Some(_) => {
                    return Err(AppError::bad_request(
                        "Parent comment belongs to a different report",
                    ));
                }
                None => return Err(AppError::not_found("Parent comment not found")),
            }
        }

        let id = self.next_ids.comment;
        self.next_ids.comment += 1;

        let comment = Comment {
            id,
            content: content.to_string(),
            report_id,
            user_id,
            parent_id,
            created_at: now,
            updated_at: None,
        };
        self.comments.insert(id, comment.clone());
        Ok(comment)
    }

    /// Nesting level of a comment, 1 for a root. Parents are followed the
    /// same way the comment tree is built, so the walk always ends.
    pub fn comment_depth(&self, id: u64) -> usize {
        let mut depth = 0;
        let mut current = self.comments.get(&id);
        while let Some(comment) = current {
            depth += 1;
            current = comment
                .parent_id
                .filter(|p| *p < comment.id)
                .and_then(|p| self.comments.get(&p));
        }
        depth
    }

    pub fn comment(&self, id: u64) -> Option<&Comment> {
        self.comments.get(&id)
    }

    pub fn comments_for(&self, report_id: u64) -> Vec<Comment> {
        self.comments
            .values()
            .filter(|c| c.report_id == report_id)
            .cloned()
            .collect()
    }

    /// The comment tree of a report with authors resolved.
    pub fn comment_thread(&self, report_id: u64) -> CommentThread {
        let comments = self.comments_for(report_id);
        CommentThread::from_comments(report_id, &comments, &self.usernames())
    }

    pub fn update_comment(
        &mut self,
        id: u64,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<Comment, AppError> {
        let comment = self
            .comments
            .get_mut(&id)
            .ok_or_else(|| AppError::not_found("Comment not found"))?;
        comment.content = content.to_string();
        comment.updated_at = Some(now);
        Ok(comment.clone())
    }

    /// Delete a comment and every reply beneath it. Returns the removed ids.
    pub fn delete_comment(&mut self, id: u64) -> Result<Vec<u64>, AppError> {
        let report_id = self
            .comments
            .get(&id)
            .map(|c| c.report_id)
            .ok_or_else(|| AppError::not_found("Comment not found"))?;

        let removed = self.comment_thread(report_id).subtree_ids(NodeKey::Saved(id));
        let doomed: HashSet<u64> = removed.iter().copied().collect();
        self.comments.retain(|cid, _| !doomed.contains(cid));
        self.mentions
            .retain(|_, m| m.comment_id.is_none_or(|cid| !doomed.contains(&cid)));
        Ok(removed)
    }

    // ---- mentions ----

    /// Replace the mentions recorded for `source` with the users named in
    /// `usernames`. Unknown names are ignored.
    pub fn replace_mentions(
        &mut self,
        source: MentionSource,
        usernames: &[String],
        now: DateTime<Utc>,
    ) -> Vec<Mention> {
        let (report_id, comment_id) = match source {
            MentionSource::Report(report_id) => (report_id, None),
            MentionSource::Comment {
                report_id,
                comment_id,
            } => (report_id, Some(comment_id)),
        };
        self.mentions
            .retain(|_, m| !(m.report_id == report_id && m.comment_id == comment_id));

        let mut user_ids: Vec<u64> = Vec::new();
        for name in usernames {
            if let Some(user) = self.user_by_username(name) {
                if !user_ids.contains(&user.id) {
                    user_ids.push(user.id);
                }
            }
        }

        let mut created = Vec::with_capacity(user_ids.len());
        for user_id in user_ids {
            let id = self.next_ids.mention;
            self.next_ids.mention += 1;
            let mention = Mention {
                id,
                user_id,
                report_id,
                comment_id,
                created_at: now,
            };
            self.mentions.insert(id, mention.clone());
            created.push(mention);
        }
        created
    }

    /// Mentions of a user, newest first.
    pub fn mentions_of(&self, user_id: u64) -> Vec<Mention> {
        let mut found: Vec<Mention> = self
            .mentions
            .values()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        found
    }

    /// Active users whose username or name starts with `query`.
    pub fn search_users(&self, query: &str, limit: usize) -> Vec<User> {
        mentions::suggest(self.users.values(), query, limit)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Map of user id to username, for rendering authors.
    pub fn usernames(&self) -> HashMap<u64, String> {
        self.users
            .values()
            .map(|u| (u.id, u.username.clone()))
            .collect()
    }
}

/// Shared handle to the database.
pub struct Store {
    db: RwLock<Database>,
    snapshot: Option<PathBuf>,
}

impl Store {
    /// A store that never touches disk.
    pub fn memory() -> Self {
        Store {
            db: RwLock::new(Database::default()),
            snapshot: None,
        }
    }

    /// Open the store in `data_dir`, loading the existing snapshot if any.
    /// Without a directory the store is memory-only.
    pub fn open(data_dir: Option<&Path>) -> Result<Self, AppError> {
        let Some(dir) = data_dir else {
            return Ok(Store::memory());
        };

        create_dir_all(dir)?;
        let path = dir.join(SNAPSHOT_FILE);
        let db = if path.exists() {
            let db = saving::load_database(&path)?;
            log::info!(
                "loaded snapshot {} ({} users, {} reports)",
                path.display(),
                db.users.len(),
                db.reports.len()
            );
            db
        } else {
            log::info!("starting with an empty database at {}", path.display());
            Database::default()
        };

        Ok(Store {
            db: RwLock::new(db),
            snapshot: Some(path),
        })
    }

    /// Run a read-only query against the database.
    pub fn read<R>(&self, f: impl FnOnce(&Database) -> R) -> Result<R, AppError> {
        let db = self
            .db
            .read()
            .map_err(|_| AppError::Storage("database lock poisoned".to_string()))?;
        Ok(f(&db))
    }

    /// Run a mutation and persist the result.
    ///
    /// The mutation runs on a copy that replaces the live database only once
    /// it is saved, so a failed closure or a failed snapshot changes nothing.
    pub fn write<R>(
        &self,
        f: impl FnOnce(&mut Database) -> Result<R, AppError>,
    ) -> Result<R, AppError> {
        let mut db = self
            .db
            .write()
            .map_err(|_| AppError::Storage("database lock poisoned".to_string()))?;
        let mut next = db.clone();
        let result = f(&mut next)?;
        if let Some(path) = &self.snapshot {
            saving::save_database(&next, path)?;
        }
        *db = next;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_user(name: &str) -> NewUser {
        NewUser {
            username: name.to_string(),
            email: format!("{}@example.com", name),
            full_name: name.to_uppercase(),
            password_hash: "hash".to_string(),
            role: UserRole::Analyst,
        }
    }

    #[test]
    fn first_user_is_superuser() {
        let mut db = Database::default();
        let first = db.create_user(new_user("root"), Utc::now()).unwrap();
        let second = db.create_user(new_user("bob"), Utc::now()).unwrap();

        assert!(first.is_superuser);
        assert_eq!(first.projects.len(), Project::ALL.len());
        assert!(!second.is_superuser);
        assert_eq!(second.role, UserRole::Analyst);
    }

    #[test]
    fn duplicate_names_are_rejected_case_insensitively() {
        let mut db = Database::default();
        db.create_user(new_user("alice"), Utc::now()).unwrap();

        let mut dup = new_user("ALICE");
        dup.email = "other@example.com".to_string();
        assert!(matches!(
            db.create_user(dup, Utc::now()),
            Err(AppError::Conflict(_))
        ));

        let mut dup_mail = new_user("alice2");
        dup_mail.email = "Alice@Example.com".to_string();
        assert!(matches!(
            db.create_user(dup_mail, Utc::now()),
            Err(AppError::Conflict(_))
        ));
    }

    #[test]
    fn login_accepts_username_or_email() {
        let mut db = Database::default();
        let alice = db.create_user(new_user("alice"), Utc::now()).unwrap();
        assert_eq!(db.user_by_login("alice").unwrap().id, alice.id);
        assert_eq!(db.user_by_login("alice@example.com").unwrap().id, alice.id);
        assert!(db.user_by_login("nobody").is_none());
    }

    #[test]
    fn replies_must_stay_on_their_report() {
        let mut db = Database::default();
        let alice = db.create_user(new_user("alice"), Utc::now()).unwrap();
        let r1 = db.create_report(alice.id, "One", "body", Utc::now());
        let r2 = db.create_report(alice.id, "Two", "body", Utc::now());
        let c1 = db.add_comment(r1.id, alice.id, None, "hi", Utc::now()).unwrap();

        let err = db
            .add_comment(r2.id, alice.id, Some(c1.id), "reply", Utc::now())
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));

        let err = db
            .add_comment(r1.id, alice.id, Some(999), "reply", Utc::now())
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn deleting_a_comment_removes_its_replies_and_mentions() {
        let mut db = Database::default();
        let alice = db.create_user(new_user("alice"), Utc::now()).unwrap();
        let bob = db.create_user(new_user("bob"), Utc::now()).unwrap();
        let report = db.create_report(alice.id, "R", "body", Utc::now());

        let root = db.add_comment(report.id, alice.id, None, "root", Utc::now()).unwrap();
        let reply = db
            .add_comment(report.id, bob.id, Some(root.id), "@alice reply", Utc::now())
            .unwrap();
        let nested = db
            .add_comment(report.id, alice.id, Some(reply.id), "nested", Utc::now())
            .unwrap();
        let other = db.add_comment(report.id, bob.id, None, "other", Utc::now()).unwrap();
        db.replace_mentions(
            MentionSource::Comment {
                report_id: report.id,
                comment_id: reply.id,
            },
            &["alice".to_string()],
            Utc::now(),
        );

        let mut removed = db.delete_comment(root.id).unwrap();
        removed.sort();
        assert_eq!(removed, vec![root.id, reply.id, nested.id]);
        assert!(db.comment(other.id).is_some());
        assert!(db.mentions_of(alice.id).is_empty());
    }

    #[test]
    fn deleting_a_report_cascades() {
        let mut db = Database::default();
        let alice = db.create_user(new_user("alice"), Utc::now()).unwrap();
        let report = db.create_report(alice.id, "R", "body", Utc::now());
        db.add_attachment(report.id, "a.txt", "attachments/a.txt", "text/plain", 3, Utc::now())
            .unwrap();
        db.add_comment(report.id, alice.id, None, "c", Utc::now()).unwrap();

        let removed = db.delete_report(report.id).unwrap();
        assert_eq!(removed.len(), 1);
        assert!(db.comments_for(report.id).is_empty());
        assert!(db.attachments_for(report.id).is_empty());
        assert!(db.delete_report(report.id).is_err());
    }

    #[test]
    fn mentions_grant_read_access() {
        let mut db = Database::default();
        let alice = db.create_user(new_user("alice"), Utc::now()).unwrap();
        let bob = db.create_user(new_user("bob"), Utc::now()).unwrap();
        let carol = db.create_user(new_user("carol"), Utc::now()).unwrap();
        let report = db.create_report(bob.id, "R", "ping @carol", Utc::now());

        db.replace_mentions(
            MentionSource::Report(report.id),
            &["carol".to_string(), "ghost".to_string(), "Carol".to_string()],
            Utc::now(),
        );

        assert!(db.can_view_report(&bob, &report));
        assert!(db.can_view_report(&alice, &report)); // superuser
        assert!(db.can_view_report(&carol, &report));
        assert!(!db.can_modify_report(&carol, &report));
        assert_eq!(db.mentions_of(carol.id).len(), 1);
    }

    #[test]
    fn reports_are_listed_newest_first() {
        let mut db = Database::default();
        let alice = db.create_user(new_user("alice"), Utc::now()).unwrap();
        let base = Utc::now();
        for i in 0..5 {
            db.create_report(
                alice.id,
                &format!("Report {}", i),
                "x",
                base + chrono::Duration::seconds(i),
            );
        }

        let page = db.list_reports(alice.id, "", 0, 2);
        assert_eq!(page.total, 5);
        assert_eq!(page.pages, 3);
        assert_eq!(page.items[0].title, "Report 4");

        let filtered = db.list_reports(alice.id, "report 1", 0, 10);
        assert_eq!(filtered.total, 1);
    }

    #[test]
    fn store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(Some(dir.path())).unwrap();
            store
                .write(|db| db.create_user(new_user("alice"), Utc::now()))
                .unwrap();
        }
        let store = Store::open(Some(dir.path())).unwrap();
        let name = store
            .read(|db| db.user_by_username("alice").map(|u| u.username.clone()))
            .unwrap();
        assert_eq!(name.as_deref(), Some("alice"));
    }

    #[test]
    fn failed_writes_do_not_persist() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(Some(dir.path())).unwrap();
        let result: Result<(), AppError> =
            store.write(|_| Err(AppError::bad_request("nope")));
        assert!(result.is_err());
        assert!(!dir.path().join(SNAPSHOT_FILE).exists());
    }

    #[test]
    fn a_failed_closure_leaves_earlier_changes_out() {
        let store = Store::memory();
        let result: Result<(), AppError> = store.write(|db| {
            db.create_user(new_user("alice"), Utc::now())?;
            Err(AppError::bad_request("rejected after the insert"))
        });
        assert!(result.is_err());
        assert_eq!(store.read(|db| db.users().count()).unwrap(), 0);
    }

    #[test]
    fn a_failed_snapshot_leaves_memory_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        let store = Store::open(Some(data.as_path())).unwrap();
        let alice = store
            .write(|db| db.create_user(new_user("alice"), Utc::now()))
            .unwrap();

        // A plain file where the data directory was makes every save fail.
        std::fs::remove_dir_all(&data).unwrap();
        std::fs::write(&data, b"not a directory").unwrap();

        let result = store.write(|db| {
            let report = db.create_report(alice.id, "Plan", "body", Utc::now());
            db.add_attachment(report.id, "a.txt", "attachments/a.txt", "text/plain", 1, Utc::now())
        });
        assert!(result.is_err());

        let (reports, attachments) = store
            .read(|db| (db.reports.len(), db.attachments.len()))
            .unwrap();
        assert_eq!((reports, attachments), (0, 0));
        println!("✓ Failed snapshot rolled back the in-memory change");
    }

    #[test]
    fn reply_chains_are_capped() {
        let mut db = Database::default();
        let alice = db.create_user(new_user("alice"), Utc::now()).unwrap();
        let report = db.create_report(alice.id, "Plan", "body", Utc::now());

        let mut parent = None;
        for _ in 0..MAX_THREAD_DEPTH {
            let c = db
                .add_comment(report.id, alice.id, parent, "deeper", Utc::now())
                .unwrap();
            parent = Some(c.id);
        }
        let deepest = parent.unwrap();
        assert_eq!(db.comment_depth(deepest), MAX_THREAD_DEPTH);

        let err = db
            .add_comment(report.id, alice.id, Some(deepest), "too deep", Utc::now())
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert_eq!(db.comment_thread(report.id).depth(), MAX_THREAD_DEPTH);
    }
}
