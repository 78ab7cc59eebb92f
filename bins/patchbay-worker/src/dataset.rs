// Dataset loading: a JSON array of instances, or one instance per line (JSONL)
use anyhow::{bail, Context, Result};
use patchbay_common::types::Instance;
use std::fs;
use std::path::Path;

pub fn load_instances(path: &Path) -> Result<Vec<Instance>> {
    if !path.exists() {
        bail!("Dataset file not found: {}", path.display());
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read dataset {}", path.display()))?;

    parse_instances(&content).with_context(|| format!("Failed to parse dataset {}", path.display()))
}

fn parse_instances(content: &str) -> Result<Vec<Instance>> {
    if content.trim_start().starts_with('[') {
        let instances: Vec<Instance> = serde_json::from_str(content).context("invalid JSON array")?;
        return Ok(instances);
    }

    let mut instances = Vec::new();
    for (line_num, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let instance: Instance = serde_json::from_str(trimmed)
            .with_context(|| format!("line {}: invalid instance record", line_num + 1))?;
        instances.push(instance);
    }
    Ok(instances)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_json_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.json");
        fs::write(
            &path,
            r#"[
                {"repo": "psf/requests", "base_commit": "abc", "patch": null,
                 "test": {"test_cmd": "pytest", "test_dir": "tests"}},
                {"repo": "pallets/flask", "base_commit": "def", "patch": "diff --git a/x b/x",
                 "test": {"test_cmd": "pytest -x", "test_dir": ""}}
            ]"#,
        )
        .unwrap();

        let instances = load_instances(&path).unwrap();

        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].repo_name(), "requests");
        assert_eq!(instances[1].patch_text(), "diff --git a/x b/x");
    }

    #[test]
    fn test_load_jsonl_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.jsonl");
        fs::write(
            &path,
            "{\"repo\": \"a/one\", \"base_commit\": \"1\", \"test\": {\"test_cmd\": \"make test\"}}\n\
             \n\
             {\"repo\": \"b/two\", \"base_commit\": \"2\", \"test\": {\"test_cmd\": \"tox\"}}\n",
        )
        .unwrap();

        let instances = load_instances(&path).unwrap();

        assert_eq!(instances.len(), 2);
        assert_eq!(instances[1].test.test_cmd, "tox");
    }

    #[test]
    fn test_jsonl_error_names_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.jsonl");
        fs::write(&path, "{\"repo\": \"a/one\"}\n{not json}\n").unwrap();

        let err = load_instances(&path).unwrap_err();

        assert!(format!("{:#}", err).contains("line 2"));
    }

    #[test]
    fn test_missing_dataset() {
        let err = load_instances(Path::new("/nonexistent/dataset.jsonl")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
