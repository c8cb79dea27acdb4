//! Multi-file YAML config loading: tag resolution (`!env`/`!file`/`!include`)
//! plus a deep merge across `--config` files at top-level-key granularity.
//!
//! Ported from `original_source/query_exporter/yaml.py`'s `_ConfigLoader`:
//! serde_yaml exposes the same three custom tags as `Value::Tagged` nodes
//! rather than a loader subclass, so resolution here is a post-parse walk
//! over the value tree instead of custom YAML constructors.

use shared::config::Config;
use shared::{ExporterError, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

const MERGED_SECTIONS: &[&str] = &["databases", "metrics", "queries", "alerts"];

/// Load and merge every `--config` file into a single validated [`Config`].
pub fn load_config(paths: &[PathBuf]) -> Result<Config> {
    if paths.is_empty() {
        return Err(ExporterError::Config("no configuration file given".into()).into());
    }

    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());
    let mut seen_names: std::collections::HashMap<&'static str, HashSet<String>> = MERGED_SECTIONS
        .iter()
        .map(|s| (*s, HashSet::new()))
        .collect();

    for path in paths {
        let document = load_document(path)?;
        merge_document(&mut merged, document, &mut seen_names, path)?;
    }

    let config: Config = serde_yaml::from_value(merged)
        .map_err(|e| ExporterError::Config(format!("invalid configuration: {e}")))?;
    config.validate()?;
    Ok(config)
}

fn load_document(path: &Path) -> Result<serde_yaml::Value> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ExporterError::Config(format!("failed to read {}: {e}", path.display())))?;
    let raw: serde_yaml::Value = serde_yaml::from_str(&text)
        .map_err(|e| ExporterError::Config(format!("failed to parse {}: {e}", path.display())))?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    resolve_tags(raw, base_dir)
}

/// Recursively resolve `!env`, `!file`, and `!include` tags in a parsed
/// value tree.
fn resolve_tags(value: serde_yaml::Value, base_dir: &Path) -> Result<serde_yaml::Value> {
    match value {
        serde_yaml::Value::Tagged(tagged) => {
            let tag = tagged.tag.to_string();
            match tag.as_str() {
                "!env" => resolve_env_tag(&tagged.value),
                "!file" => resolve_file_tag(&tagged.value, base_dir),
                "!include" => resolve_include_tag(&tagged.value, base_dir),
                other => Err(ExporterError::Config(format!("unknown tag {other}")).into()),
            }
        }
        serde_yaml::Value::Mapping(map) => {
            let mut out = serde_yaml::Mapping::new();
            for (k, v) in map {
                out.insert(resolve_tags(k, base_dir)?, resolve_tags(v, base_dir)?);
            }
            Ok(serde_yaml::Value::Mapping(out))
        }
        serde_yaml::Value::Sequence(seq) => Ok(serde_yaml::Value::Sequence(
            seq.into_iter()
                .map(|v| resolve_tags(v, base_dir))
                .collect::<Result<Vec<_>>>()?,
        )),
        other => Ok(other),
    }
}

fn resolve_env_tag(value: &serde_yaml::Value) -> Result<serde_yaml::Value> {
    let name = value
        .as_str()
        .ok_or_else(|| ExporterError::Config("!env tag requires a string argument".into()))?;
    let raw = std::env::var(name)
        .map_err(|_| ExporterError::Config(format!("environment variable {name} undefined")))?;
    serde_yaml::from_str(&raw).or_else(|_| Ok(serde_yaml::Value::String(raw)))
}

fn resolve_file_tag(value: &serde_yaml::Value, base_dir: &Path) -> Result<serde_yaml::Value> {
    let relative = value
        .as_str()
        .ok_or_else(|| ExporterError::Config("!file tag requires a string argument".into()))?;
    let path = base_dir.join(relative);
    let contents = std::fs::read_to_string(&path)
        .map_err(|e| ExporterError::Config(format!("file {} not found: {e}", path.display())))?;
    Ok(serde_yaml::Value::String(contents.trim().to_string()))
}

fn resolve_include_tag(value: &serde_yaml::Value, base_dir: &Path) -> Result<serde_yaml::Value> {
    let relative = value
        .as_str()
        .ok_or_else(|| ExporterError::Config("!include tag requires a string argument".into()))?;
    let path = base_dir.join(relative);
    load_document(&path)
}

/// Merge one resolved document into the accumulator. `databases`, `metrics`,
/// `queries`, and `alerts` merge key-by-key across files, rejecting a name
/// reused across files; every other top-level key (`alertmanager`,
/// `builtin-metrics`) is taken from whichever file defines it, the later
/// file winning if more than one does (these are singleton sections, not
/// named collections, so there's nothing to collide on by name).
fn merge_document(
    accumulator: &mut serde_yaml::Value,
    document: serde_yaml::Value,
    seen_names: &mut std::collections::HashMap<&'static str, HashSet<String>>,
    path: &Path,
) -> Result<()> {
    let serde_yaml::Value::Mapping(doc_map) = document else {
        return Err(ExporterError::Config(format!(
            "{}: top-level document must be a mapping",
            path.display()
        ))
        .into());
    };
    let serde_yaml::Value::Mapping(acc_map) = accumulator else {
        unreachable!("accumulator is always constructed as a mapping");
    };

    for (key, value) in doc_map {
        let key_str = key.as_str().unwrap_or_default().to_string();
        if let Some(section) = MERGED_SECTIONS.iter().find(|s| **s == key_str) {
            let serde_yaml::Value::Mapping(section_map) = value else {
                return Err(ExporterError::Config(format!("{key_str} must be a mapping")).into());
            };
            let names = seen_names.get_mut(*section).expect("section tracked");
            let entry = acc_map
                .entry(serde_yaml::Value::String(key_str.clone()))
                .or_insert_with(|| serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
            let serde_yaml::Value::Mapping(entry_map) = entry else {
                unreachable!("section accumulator is always a mapping");
            };
            for (name, def) in section_map {
                let name_str = name.as_str().unwrap_or_default().to_string();
                if !names.insert(name_str.clone()) {
                    return Err(ExporterError::Config(format!(
                        "duplicate {key_str} entry {name_str:?} (in {})",
                        path.display()
                    ))
                    .into());
                }
                entry_map.insert(serde_yaml::Value::String(name_str), def);
            }
        } else {
            acc_map.insert(serde_yaml::Value::String(key_str), value);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn file_tag_substitutes_trimmed_contents() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir, "secret.txt", "s3kr3t\n");
        let main = write_file(
            &dir,
            "main.yaml",
            "databases:\n  db:\n    dsn: !file secret.txt\nmetrics: {}\nqueries: {}\n",
        );

        let doc = load_document(&main).unwrap();
        let dsn = doc
            .get("databases")
            .and_then(|d| d.get("db"))
            .and_then(|d| d.get("dsn"))
            .and_then(|v| v.as_str())
            .unwrap();
        assert_eq!(dsn, "s3kr3t");
    }

    #[test]
    fn include_tag_merges_nested_document() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir, "extra.yaml", "extra_key: 42\n");
        let main = write_file(&dir, "main.yaml", "top: !include extra.yaml\n");

        let doc = load_document(&main).unwrap();
        let value = doc.get("top").and_then(|t| t.get("extra_key")).unwrap();
        assert_eq!(value.as_i64(), Some(42));
    }

    #[test]
    fn duplicate_query_name_across_files_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_file(
            &dir,
            "a.yaml",
            "databases: {}\nmetrics: {}\nqueries:\n  q1:\n    databases: []\n    metrics: []\n    sql: select 1\n",
        );
        let b = write_file(
            &dir,
            "b.yaml",
            "databases: {}\nmetrics: {}\nqueries:\n  q1:\n    databases: []\n    metrics: []\n    sql: select 2\n",
        );

        let err = load_config(&[a, b]).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn env_tag_reparses_value_as_yaml() {
        std::env::set_var("QE_TEST_PORT", "9999");
        let dir = tempfile::tempdir().unwrap();
        let main = write_file(&dir, "main.yaml", "port: !env QE_TEST_PORT\n");

        let doc = load_document(&main).unwrap();
        assert_eq!(doc.get("port").and_then(|v| v.as_i64()), Some(9999));
        std::env::remove_var("QE_TEST_PORT");
    }
}
