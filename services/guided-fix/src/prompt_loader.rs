use anyhow::{Context, Result, bail};
use guided_fix_core::openai_guide::{GUIDANCE_PROMPT, PLAN_PROMPT, QUESTION_PROMPT};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Placeholders a prompt override must keep, by prompt key.
const REQUIRED_PLACEHOLDERS: &[(&str, &[&str])] = &[
    (GUIDANCE_PROMPT, &["{category}", "{instruction}", "{step_context}"]),
    (PLAN_PROMPT, &["{category}", "{diagnosis}"]),
    (QUESTION_PROMPT, &["{question}"]),
];

/// Loads `<key>.md` prompt overrides from `dir_path`.
///
/// A missing directory yields an empty map and the built-in templates are used.
pub fn load_prompts(dir_path: &Path) -> Result<HashMap<String, String>> {
    let mut prompts = HashMap::new();
    if !dir_path.exists() {
        tracing::info!(
            "Prompts directory {} not found, using built-in prompts",
            dir_path.display()
        );
        return Ok(prompts);
    }

    for entry in fs::read_dir(dir_path)
        .with_context(|| format!("Failed to read prompts directory: {}", dir_path.display()))?
    {
        let entry = entry?;
        let path = entry.path();

        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("md") {
            let prompt_key = path
                .file_stem()
                .and_then(|s| s.to_str())
                .context("Could not get file stem for prompt file")?
                .to_string();

            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read prompt file: {}", path.display()))?;

            validate_prompt(&prompt_key, &content)?;
            prompts.insert(prompt_key, content);
        }
    }

    Ok(prompts)
}

fn validate_prompt(key: &str, content: &str) -> Result<()> {
    let Some((_, required)) = REQUIRED_PLACEHOLDERS.iter().find(|(k, _)| *k == key) else {
        tracing::warn!("Prompt '{key}' is not used by any guide, ignoring its contents");
        return Ok(());
    };
    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|p| !content.contains(p))
        .collect();
    if !missing.is_empty() {
        bail!("Prompt '{key}' is missing placeholder(s): {}", missing.join(", "));
    }
    Ok(())
}
