//! Durable Skills
//!
//! Skills are reusable Python modules an agent saved after running them
//! successfully. The SQLite store is authoritative; the working tree is a
//! derived copy that code under execution imports as `skills.<category>.<name>`.
//!
//! # Architecture
//!
//! ```text
//! source ──► SyntaxChecker ──► Dependency Extractor ──► SkillStore (SQLite)
//!                                                          │
//!                                                          ▼ hydrate
//!                                                     Materializer
//!                                                          │
//!                                                          ▼
//!                                   <skills_dir>/<namespace>/<category>/<name>/
//! ```
//!
//! Every store query is scoped by [`Namespace`]. Each namespace gets its own
//! working-tree root.

pub mod extractor;
pub mod materializer;
pub mod store;
pub mod syntax;
pub mod types;

pub use extractor::extract_dependencies;
pub use materializer::{render_entry, EntryMeta, HydrationReport, Materializer, SkippedEntry};
pub use store::{LoadedRecord, SkillStore};
pub use syntax::{check_syntax, extract_docstring, SyntaxChecker, SyntaxIssue};
pub use types::{
    normalize_tags, validate_segment, CapabilityRef, Namespace, SkillIdentity, SkillRecord,
    SkillStats,
};
