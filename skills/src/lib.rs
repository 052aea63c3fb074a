//! Skill library: reusable knowledge documents with optional executable
//! workflows.
//!
//! A skill lives in its own directory as `SKILL.md` (YAML frontmatter plus
//! a markdown body) with optional `scripts/`, `references/` and `assets/`
//! side files. The store handles validated CRUD with atomic writes and
//! timestamped backups; the registry keeps the validated in-memory index
//! the gateway serves prompts and skill tools from.

pub mod document;
pub mod error;
pub mod store;
pub mod types;

pub use document::{expand_env, parse_document, render_document, validate};
pub use error::SkillError;
pub use store::{SkillRegistry, SkillStore, MAX_SIDE_FILE_BYTES};
pub use types::{Skill, SkillState};
