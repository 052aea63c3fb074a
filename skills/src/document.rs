//! `SKILL.md` document format.
//!
//! YAML frontmatter between `---` fences, then a markdown body. Env
//! expansion (`${VAR}`, `${VAR:-default}`, `${VAR:+alt}` with POSIX
//! set-and-non-empty semantics) is applied to the frontmatter only; the
//! body is preserved byte for byte.

use tracing::debug;

use crate::{
    error::SkillError,
    types::{is_valid_skill_name, Skill},
};

const FENCE: &str = "---";

/// Parse a skill document, expanding environment variables in the
/// frontmatter from the process environment.
pub fn parse_document(source: &str) -> Result<Skill, SkillError> {
    parse_document_with_env(source, &|name| std::env::var(name).ok())
}

/// Parse with an injectable variable lookup.
pub fn parse_document_with_env(
    source: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<Skill, SkillError> {
    let rest = source
        .strip_prefix(FENCE)
        .and_then(|rest| rest.strip_prefix('\n'))
        .ok_or_else(|| {
            SkillError::InvalidDocument("missing opening '---' frontmatter fence".to_string())
        })?;
    let (frontmatter, body) = split_at_closing_fence(rest).ok_or_else(|| {
        SkillError::InvalidDocument("missing closing '---' frontmatter fence".to_string())
    })?;

    let expanded = expand_env(frontmatter, lookup);
    let mut skill: Skill = serde_yaml::from_str(&expanded)?;
    skill.body = body.to_string();
    validate(&skill)?;
    Ok(skill)
}

fn split_at_closing_fence(rest: &str) -> Option<(&str, &str)> {
    // Closing fence is a '---' line; the body starts after it, minus one
    // optional blank separator line.
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end_matches(['\r', '\n']) == FENCE {
            let frontmatter = &rest[..offset];
            let mut body = &rest[offset + line.len()..];
            body = body.strip_prefix('\n').unwrap_or(body);
            return Some((frontmatter, body));
        }
        offset += line.len();
    }
    None
}

/// Render a skill back to `SKILL.md` form.
pub fn render_document(skill: &Skill) -> Result<String, SkillError> {
    validate(skill)?;
    let frontmatter = serde_yaml::to_string(skill)?;
    Ok(format!("{FENCE}\n{frontmatter}{FENCE}\n\n{}", skill.body))
}

/// Structural validation shared by load and save paths.
pub fn validate(skill: &Skill) -> Result<(), SkillError> {
    if !is_valid_skill_name(&skill.name) {
        return Err(SkillError::InvalidName(skill.name.clone()));
    }
    if skill.description.trim().is_empty() {
        return Err(SkillError::Validation(format!(
            "skill '{}' has an empty description",
            skill.name
        )));
    }
    if !skill.workflow.is_empty() {
        // Duplicate ids, dangling depends_on and cycles all surface here.
        toolgrid_workflow::plan(&skill.workflow)
            .map_err(|err| SkillError::Validation(format!("skill '{}': {}", skill.name, err)))?;
        for step in &skill.workflow {
            step.timeout_duration()
                .map_err(|err| SkillError::Validation(format!("step '{}': {}", step.id, err)))?;
            step.retry_schedule()
                .map_err(|err| SkillError::Validation(format!("step '{}': {}", step.id, err)))?;
        }
    }
    if let Some(output) = &skill.output {
        if output.format == toolgrid_workflow::OutputFormat::Custom && output.template.is_none() {
            return Err(SkillError::Validation(format!(
                "skill '{}': custom output requires a template",
                skill.name
            )));
        }
    }
    Ok(())
}

/// POSIX-style variable expansion.
///
/// - `${VAR}`: value, or empty when unset
/// - `${VAR:-default}`: value when set and non-empty, else the default
/// - `${VAR:+alt}`: alt when set and non-empty, else empty
///
/// Unterminated expressions are left verbatim.
pub fn expand_env(input: &str, lookup: &dyn Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        out.push_str(&expand_one(&after[..end], lookup));
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

fn expand_one(expr: &str, lookup: &dyn Fn(&str) -> Option<String>) -> String {
    if let Some((name, default)) = expr.split_once(":-") {
        return match lookup(name).filter(|v| !v.is_empty()) {
            Some(value) => value,
            None => default.to_string(),
        };
    }
    if let Some((name, alt)) = expr.split_once(":+") {
        return match lookup(name).filter(|v| !v.is_empty()) {
            Some(_) => alt.to_string(),
            None => String::new(),
        };
    }
    let value = lookup(expr).unwrap_or_default();
    if value.is_empty() {
        debug!("'${{{expr}}}' expanded to empty string");
    }
    value
}
