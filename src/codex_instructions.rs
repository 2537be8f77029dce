use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, ShimError};
use crate::models::ModelFamily;

/// Instructions shipped with the binary, used when nothing is configured
const BUNDLED_INSTRUCTIONS: &str = include_str!("prompts/codex_instructions.md");

const ALL_FAMILIES: [ModelFamily; 5] = [
    ModelFamily::Gpt53Codex,
    ModelFamily::CodexMax,
    ModelFamily::Codex,
    ModelFamily::Gpt52,
    ModelFamily::Gpt51,
];

impl ModelFamily {
    /// File name looked up in an instructions directory
    fn prompt_file(self) -> String {
        format!("{}.md", self.as_str())
    }
}

/// Codex `instructions` text, loaded once at startup.
#[derive(Debug, Clone)]
pub struct InstructionsProvider {
    default: String,
    per_family: Vec<(ModelFamily, String)>,
}

impl Default for InstructionsProvider {
    fn default() -> Self {
        Self::bundled()
    }
}

fn read_prompt(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|source| ShimError::InstructionsRead {
        path: path.display().to_string(),
        source,
    })
}

impl InstructionsProvider {
    pub fn bundled() -> Self {
        Self {
            default: BUNDLED_INSTRUCTIONS.to_string(),
            per_family: Vec::new(),
        }
    }

    /// Load instructions from `path`.
    ///
    /// A file applies to every model family. A directory may hold one
    /// `<family>.md` per family (`gpt-5.3-codex.md`, `codex-max.md`, ...);
    /// families without a file get the bundled text.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::bundled());
        };

        if !path.is_dir() {
            let text = read_prompt(path)?;
            tracing::info!(path = %path.display(), "loaded Codex instructions");
            return Ok(Self {
                default: text,
                per_family: Vec::new(),
            });
        }

        let mut per_family = Vec::new();
        for family in ALL_FAMILIES {
            let file: PathBuf = path.join(family.prompt_file());
            if file.is_file() {
                per_family.push((family, read_prompt(&file)?));
                tracing::info!(%family, path = %file.display(), "loaded Codex instructions");
            }
        }
        if per_family.is_empty() {
            tracing::warn!(
                dir = %path.display(),
                "no per-family instructions found, using bundled instructions"
            );
        }

        Ok(Self {
            default: BUNDLED_INSTRUCTIONS.to_string(),
            per_family,
        })
    }

    pub fn for_family(&self, family: ModelFamily) -> &str {
        self.per_family
            .iter()
            .find(|(f, _)| *f == family)
            .map(|(_, text)| text.as_str())
            .unwrap_or(self.default.as_str())
    }

    pub fn for_model(&self, model: &str) -> &str {
        self.for_family(ModelFamily::from_model(model))
    }
}

/// Developer message telling Codex which OpenCode tools replace its own
pub const CODEX_OPENCODE_BRIDGE: &str = r#"# Codex Running in OpenCode

You are running Codex through OpenCode. OpenCode provides its own tools but follows Codex operating principles.

## CRITICAL: Tool Replacements

<critical_rule priority="0">
apply_patch DOES NOT EXIST -> USE "edit" INSTEAD
- NEVER use: apply_patch, applyPatch
- ALWAYS use: edit for changes to existing files, write for new files
</critical_rule>

<critical_rule priority="0">
update_plan DOES NOT EXIST -> USE "todowrite" INSTEAD
- NEVER use: update_plan, updatePlan, read_plan, readPlan
- ALWAYS use: todowrite for plan updates, todoread to review the plan
</critical_rule>

## Available OpenCode Tools

- read, edit, write: file access (edit requires a prior read)
- grep, glob, list: search and discovery
- bash: run shell commands
- todowrite, todoread: task tracking
- task: delegate work to a sub-agent
- webfetch: fetch web content

## Substitution Rules

apply_patch  ->  edit
update_plan  ->  todowrite
read_plan    ->  todoread

## What Remains from Codex

Sandbox policies, approval mechanisms, final answer formatting, git commit protocols, and file reference formats all follow Codex instructions."#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_instructions_serve_every_family() {
        let provider = InstructionsProvider::load(None).unwrap();
        for family in ALL_FAMILIES {
            assert_eq!(provider.for_family(family), BUNDLED_INSTRUCTIONS);
        }
        assert!(!BUNDLED_INSTRUCTIONS.trim().is_empty());
    }

    #[test]
    fn single_file_applies_to_all_families() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("custom.md");
        fs::write(&file, "custom instructions").unwrap();

        let provider = InstructionsProvider::load(Some(&file)).unwrap();
        assert_eq!(provider.for_family(ModelFamily::Gpt52), "custom instructions");
        assert_eq!(provider.for_model("gpt-5.3-codex"), "custom instructions");
    }

    #[test]
    fn directory_overrides_only_present_families() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("gpt-5.2.md"), "general prompt").unwrap();
        fs::write(dir.path().join("codex-max.md"), "max prompt").unwrap();

        let provider = InstructionsProvider::load(Some(dir.path())).unwrap();
        assert_eq!(provider.for_model("gpt-5.2"), "general prompt");
        assert_eq!(provider.for_model("gpt-5.1-codex-max"), "max prompt");
        assert_eq!(provider.for_model("gpt-5.3-codex"), BUNDLED_INSTRUCTIONS);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.md");
        let err = InstructionsProvider::load(Some(&missing)).unwrap_err();
        assert!(matches!(err, ShimError::InstructionsRead { .. }));
    }

    #[test]
    fn bridge_maps_codex_tools_to_opencode() {
        assert!(CODEX_OPENCODE_BRIDGE.contains("apply_patch DOES NOT EXIST"));
        assert!(CODEX_OPENCODE_BRIDGE.contains("todowrite"));
    }
}
