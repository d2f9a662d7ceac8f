//! Prompt catalog loader.
//!
//! The catalog is a TOML file declaring named text blocks, variants that
//! compose them per phase, per-channel profile overrides, and a `current`
//! pointer. A missing file falls back to a built-in minimal catalog so a
//! fresh checkout still answers messages.

use std::collections::BTreeMap;
use std::path::Path;

use hearth_types::error::EngineError;
use hearth_types::prompt::{ChannelProfile, PromptCatalog, PromptVariant};
use tracing::warn;

/// Load a catalog from disk, validating the `current` pointer.
pub fn load(path: &Path) -> Result<PromptCatalog, EngineError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        EngineError::Configuration(format!("cannot read prompt catalog {}: {e}", path.display()))
    })?;
    parse(&raw)
}

/// Load a catalog, falling back to the built-in default when the file is
/// missing or malformed.
pub fn load_or_default(path: &Path) -> PromptCatalog {
    match load(path) {
        Ok(catalog) => catalog,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "prompt catalog unavailable, using built-in defaults");
            default_catalog()
        }
    }
}

fn parse(raw: &str) -> Result<PromptCatalog, EngineError> {
    let catalog: PromptCatalog = toml::from_str(raw)
        .map_err(|e| EngineError::Configuration(format!("invalid prompt catalog: {e}")))?;

    if catalog.prompts.is_empty() {
        return Err(EngineError::Configuration(
            "prompt catalog declares no variants".to_string(),
        ));
    }
    if !catalog.prompts.contains_key(&catalog.current) {
        return Err(EngineError::Configuration(format!(
            "prompt catalog 'current' points at unknown variant '{}'",
            catalog.current
        )));
    }
    for (variant_name, variant) in &catalog.prompts {
        for block in variant
            .system_blocks
            .iter()
            .chain(&variant.understanding_blocks)
            .chain(&variant.tool_planning_blocks)
            .chain(&variant.response_blocks)
        {
            if !catalog.blocks.contains_key(block) {
                return Err(EngineError::Configuration(format!(
                    "variant '{variant_name}' references unknown block '{block}'"
                )));
            }
        }
    }
    Ok(catalog)
}

/// Minimal built-in catalog used when no file is configured.
pub fn default_catalog() -> PromptCatalog {
    let blocks = BTreeMap::from([
        (
            "core_identity".to_string(),
            "你是一个家庭助理。你通过通用工具读写家庭记忆，所有业务判断由你决定。\n\
             可用工具：\n{{DYNAMIC_TOOLS}}"
                .to_string(),
        ),
        (
            "analysis_contract".to_string(),
            "阅读用户消息和上下文，输出 JSON：{\"understanding\": {...}, \"context_requests\": [...], \
             \"tool_plan\": {\"steps\": [...]}, \"response_directives\": {...}}。\n\
             工具完整定义：\n{{DYNAMIC_TOOL_SPECS}}"
                .to_string(),
        ),
        (
            "response_contract".to_string(),
            "根据 understanding 与 execution_result 生成给用户的最终回复。工具失败时要如实告知。"
                .to_string(),
        ),
        (
            "response_compact".to_string(),
            "回复保持简短，适合即时通讯窗口阅读。".to_string(),
        ),
    ]);

    let default_variant = PromptVariant {
        system_blocks: vec!["core_identity".to_string()],
        understanding_blocks: vec!["analysis_contract".to_string()],
        tool_planning_blocks: vec!["analysis_contract".to_string()],
        response_blocks: vec!["response_contract".to_string()],
        profiles: BTreeMap::from([(
            "threema".to_string(),
            ChannelProfile {
                response_blocks: Some(vec![
                    "response_contract".to_string(),
                    "response_compact".to_string(),
                ]),
                max_reply_chars: Some(1000),
            },
        )]),
    };

    PromptCatalog {
        blocks,
        prompts: BTreeMap::from([("v5_unified".to_string(), default_variant)]),
        current: "v5_unified".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
current = "v1"

[blocks]
core = "You are a family assistant.\n{{DYNAMIC_TOOLS}}"
respond = "Write the final reply."
respond_short = "Keep it short."

[prompts.v1]
system_blocks = ["core"]
understanding_blocks = ["core"]
tool_planning_blocks = ["core"]
response_blocks = ["respond"]

[prompts.v1.profiles.threema]
response_blocks = ["respond", "respond_short"]
max_reply_chars = 800
"#;

    #[test]
    fn test_parse_sample_catalog() {
        let catalog = parse(SAMPLE).unwrap();
        assert_eq!(catalog.current, "v1");
        let variant = &catalog.prompts["v1"];
        assert_eq!(variant.system_blocks, vec!["core"]);
        let profile = &variant.profiles["threema"];
        assert_eq!(profile.max_reply_chars, Some(800));
    }

    #[test]
    fn test_current_must_exist() {
        let bad = SAMPLE.replace("current = \"v1\"", "current = \"v9\"");
        assert!(parse(&bad).is_err());
    }

    #[test]
    fn test_unknown_block_reference_fails() {
        let bad = SAMPLE.replace("system_blocks = [\"core\"]", "system_blocks = [\"nope\"]");
        assert!(parse(&bad).is_err());
    }

    #[test]
    fn test_load_or_default_falls_back() {
        let catalog = load_or_default(Path::new("/nonexistent/prompts.toml"));
        assert!(catalog.prompts.contains_key(&catalog.current));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let catalog = load(file.path()).unwrap();
        assert_eq!(catalog.current, "v1");
    }

    #[test]
    fn test_default_catalog_is_internally_consistent() {
        let catalog = default_catalog();
        assert!(catalog.prompts.contains_key(&catalog.current));
        for variant in catalog.prompts.values() {
            for block in variant
                .system_blocks
                .iter()
                .chain(&variant.response_blocks)
            {
                assert!(catalog.blocks.contains_key(block));
            }
        }
    }
}
