//! Review prompt assembly.
//!
//! The prompt is the bundled review skill followed by a short tail naming
//! the target patchset and the companion query tool.

/// Embedded review instructions shipped with the binary.
pub const SKILL: &str = include_str!("../../skills/code-review/SKILL.md");

/// Name of the companion Gerrit query tool the assistant calls. Resolved
/// through `PATH` in the assistant's environment.
pub const QUERY_TOOL: &str = "gerrit-cli";

/// Builds the full prompt for one review task.
#[must_use]
pub fn build_prompt(project: &str, change_number: u64, revision_number: u32) -> String {
    format!(
        "{SKILL}\n\
         ---\n\n\
         ## Your Task\n\n\
         Review Gerrit change **{change_number}** (Patchset {revision_number}) \
         in project **{project}**.\n\n\
         The `{QUERY_TOOL}` tool is available in PATH.\n\n\
         Follow the review workflow described above. Start with Phase 1:\n\n\
         ```bash\n\
         {QUERY_TOOL} summary {change_number}\n\
         ```\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skill_is_embedded_and_non_trivial() {
        assert!(SKILL.contains("# Gerrit Code Review"));
        assert!(SKILL.contains("Phase 1"));
        assert!(SKILL.len() > 500);
    }

    #[test]
    fn prompt_names_the_target_patchset() {
        let prompt = build_prompt("tools/build", 12345, 3);
        assert!(prompt.starts_with(SKILL));
        assert!(prompt.contains("change **12345** (Patchset 3)"));
        assert!(prompt.contains("project **tools/build**"));
        assert!(prompt.contains("gerrit-cli summary 12345"));
    }
}
