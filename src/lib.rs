/*!
# Reportdesk

A small collaboration service for written reports, built in Rust.

## Overview

Users sign in, write markdown reports with file attachments and discuss them
in threaded comments. Writing `@username` in a report or comment mentions
that user, which shares the report with them and shows up in their mention
list.

## Architecture

### HTTP layer (`web` feature)
- **Technologies**: axum, tower-http
- **Key Components**:
  - Router - Everything under `/api`, inline images under `/uploads/inline`
  - Auth middleware - Bearer token or `session` cookie
  - Handlers - One group per module below

### Core
- Comment Tree - Builds reply trees and applies optimistic edits
- Mentions - Extraction, autocompletion and suggestion ranking
- Store - All records in one locked in-memory database
- Access Rules - Who may see and change reports and comments

### Data Persistence Layer
- Snapshot of the whole database with Gzip compression and bincode serialization
- Uploaded files kept on disk under the upload directory

### Client (`client` feature)
- Typed reqwest client for every endpoint
- `CommentSection`: optimistic posting, editing and deleting of comments

## Modules

- **comments**: Threaded comment tree and comment handlers
- **mentions**: `@username` parsing, autocompletion and the mention list
- **reports**: Report listing, pagination and report handlers
- **uploads**: Attachment and inline image storage
- **login**: User authentication, session management and user administration
- **mailer**: Password reset email functionality
- **store**: Database, access rules and the shared store handle
- **saving**: Database persistence with compression
- **config**: Settings from the environment
- **error**: Error type and its HTTP mapping
- **app**: Routing and middleware
- **client**: HTTP client

## REST API Endpoints

- `/api/auth/...` - Register, login, logout, password change and reset
- `/api/users` - User administration and mention search
- `/api/reports` - Report CRUD, attachments and inline images
- `/api/comments` - Comment threads
- `/api/mentions` - Where the current user was mentioned
*/

pub mod comments;
pub mod config;
pub mod error;
pub mod login;
pub mod mailer;
pub mod mentions;
pub mod models;
pub mod reports;
pub mod saving;
pub mod store;
pub mod uploads;

#[cfg(feature = "web")]
pub mod app;

#[cfg(feature = "client")]
pub mod client;

pub use comments::{CommentNode, CommentThread, NodeKey, ThreadError, build_forest};
pub use config::Settings;
pub use error::AppError;
pub use models::*;
pub use store::{Database, Store};
