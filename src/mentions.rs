//! `@username` mentions: extraction from text and autocompletion while typing.

use lazy_static::lazy_static;
use regex::Regex;

use crate::models::{User, UserResponse};

lazy_static! {
    // The leading group keeps email addresses like bob@example.com out.
    static ref MENTION_RE: Regex =
        Regex::new(r"(?:^|[^\w@.-])@([\w.-]+)").expect("mention pattern is valid");
}

/// Maximum number of suggestions returned by default
pub const DEFAULT_SUGGESTIONS: usize = 8;

fn is_handle_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '.' || c == '-'
}

/// Whether `next`, the character after a handle, ends a mention.
fn ends_mention(next: Option<char>) -> bool {
    match next {
        None => true,
        Some(c) => c.is_whitespace() || matches!(c, '.' | ',' | '!' | '?'),
    }
}

/// Extract mentioned usernames from `text`, in order of first appearance.
///
/// A handle counts only when followed by whitespace, the end of the text or
/// one of `.,!?`; `"@bob's"` and `"(@bob)"` mention nobody. Trailing `.` and
/// `-` are treated as punctuation, so `"thanks @bob."` mentions `bob`.
/// Duplicates are dropped, ignoring case.
///
/// # Examples
/// ```
/// use reportdesk::mentions::extract_mentions;
///
/// let names = extract_mentions("cc @alice, @bob. and @alice again");
/// assert_eq!(names, vec!["alice", "bob"]);
/// ```
pub fn extract_mentions(text: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for caps in MENTION_RE.captures_iter(text) {
        let handle = &caps[1];
        let end = caps.get(1).map_or(0, |m| m.end());
        if !ends_mention(text[end..].chars().next()) {
            continue;
        }
        let name = handle.trim_end_matches(['.', '-']);
        if name.is_empty() {
            continue;
        }
        if !found.iter().any(|n| n.eq_ignore_ascii_case(name)) {
            found.push(name.to_string());
        }
    }
    found
}

/// Where a mention being typed starts and what has been typed so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveMention<'a> {
    /// Byte offset of the `@`
    pub start: usize,
    /// Text typed after the `@`, possibly empty
    pub query: &'a str,
}

/// Find the mention being typed just before `cursor` (a byte offset).
///
/// Returns `None` when the cursor is not right after `@` plus handle
/// characters, or when the `@` is glued to a preceding word.
pub fn active_mention(text: &str, cursor: usize) -> Option<ActiveMention<'_>> {
    if cursor > text.len() || !text.is_char_boundary(cursor) {
        return None;
    }
    let before = &text[..cursor];
    let at = before.rfind('@')?;
    let query = &before[at + 1..];
    if !query.chars().all(is_handle_char) {
        return None;
    }
    if let Some(prev) = before[..at].chars().next_back() {
        if is_handle_char(prev) || prev == '@' {
            return None;
        }
    }
    Some(ActiveMention { start: at, query })
}

/// The partial handle being typed at `cursor`, e.g. `"hi @al|"` gives `"al"`.
pub fn active_query(text: &str, cursor: usize) -> Option<&str> {
    active_mention(text, cursor).map(|m| m.query)
}

/// Replace the mention being typed at `cursor` with `@username `.
///
/// Returns the new text and the cursor position just after the inserted
/// mention, or `None` if no mention is being typed.
pub fn complete(text: &str, cursor: usize, username: &str) -> Option<(String, usize)> {
    let active = active_mention(text, cursor)?;
    let rest = &text[cursor..];

    let mut out = String::with_capacity(text.len() + username.len() + 2);
    out.push_str(&text[..active.start]);
    out.push('@');
    out.push_str(username);
    let mut new_cursor = out.len();
    if !rest.starts_with(char::is_whitespace) {
        out.push(' ');
    }
    new_cursor += 1;
    out.push_str(rest);

    let end = out.len();
    Some((out, new_cursor.min(end)))
}

/// Anything that can be offered as a mention suggestion.
pub trait Mentionable {
    fn handle(&self) -> &str;
    fn display_name(&self) -> &str;
    fn is_active(&self) -> bool;
}

impl Mentionable for User {
    fn handle(&self) -> &str {
        &self.username
    }
    fn display_name(&self) -> &str {
        &self.full_name
    }
    fn is_active(&self) -> bool {
        self.is_active
    }
}

impl Mentionable for UserResponse {
    fn handle(&self) -> &str {
        &self.username
    }
    fn display_name(&self) -> &str {
        &self.full_name
    }
    fn is_active(&self) -> bool {
        self.is_active
    }
}

/// Rank candidates for `query`: username prefix matches first, then users
/// with a word of their full name starting with the query. Case is ignored
/// and inactive users are never suggested. An empty query lists everyone.
pub fn suggest<'a, T, I>(candidates: I, query: &str, limit: usize) -> Vec<&'a T>
where
    T: Mentionable + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let query = query.trim().trim_start_matches('@').to_lowercase();

    let mut ranked: Vec<(u8, String, &'a T)> = candidates
        .into_iter()
        .filter(|c| c.is_active())
        .filter_map(|c| {
            let handle = c.handle().to_lowercase();
            let rank = if handle.starts_with(&query) {
                0
            } else if c
                .display_name()
                .split_whitespace()
                .any(|word| word.to_lowercase().starts_with(&query))
            {
                1
            } else {
                return None;
            };
            Some((rank, handle, c))
        })
        .collect();

    ranked.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    ranked.into_iter().take(limit).map(|(_, _, c)| c).collect()
}

// Web handler functions below (only compiled with "web" feature)

#[cfg(feature = "web")]
pub use handlers::*;

#[cfg(feature = "web")]
mod handlers {
    use axum::{Extension, Json, extract::State};

    use crate::app::SharedState;
    use crate::error::AppError;
    use crate::login::AuthUser;
    use crate::models::MentionResponse;

    /// List the places where the current user was mentioned, newest first.
    pub async fn list_my_mentions(
        State(state): State<SharedState>,
        Extension(auth): Extension<AuthUser>,
    ) -> Result<Json<Vec<MentionResponse>>, AppError> {
        let mentions = state.store.read(|db| {
            db.mentions_of(auth.user.id)
                .into_iter()
                .filter_map(|m| {
                    let report = db.report(m.report_id)?;
                    Some(MentionResponse {
                        id: m.id,
                        report_id: m.report_id,
                        comment_id: m.comment_id,
                        created_at: m.created_at,
                        report_title: report.title.clone(),
                    })
                })
                .collect::<Vec<_>>()
        })?;
        Ok(Json(mentions))
    }
}
