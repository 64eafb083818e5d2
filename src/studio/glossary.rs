use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

pub const GLOSSARY_PLACEHOLDER: &str = "(no style glossary loaded)";

/// Category name (file stem) to raw JSON. Never inspected, only forwarded.
#[derive(Debug, Clone, Default)]
pub struct StyleGlossary {
    categories: BTreeMap<String, Value>,
}

impl StyleGlossary {
    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn category_names(&self) -> impl Iterator<Item = &str> {
        self.categories.keys().map(|name| name.as_str())
    }

    pub fn to_prompt_block(&self) -> String {
        if self.categories.is_empty() {
            return GLOSSARY_PLACEHOLDER.to_string();
        }
        serde_json::to_string_pretty(&self.categories)
            .unwrap_or_else(|_| GLOSSARY_PLACEHOLDER.to_string())
    }
}

/// Serializes an optional glossary for the assistant prompt.
pub fn glossary_prompt_block(glossary: Option<&StyleGlossary>) -> String {
    glossary
        .map(StyleGlossary::to_prompt_block)
        .unwrap_or_else(|| GLOSSARY_PLACEHOLDER.to_string())
}

#[derive(Debug, Clone, Default)]
pub struct GlossaryLoad {
    pub glossary: StyleGlossary,
    pub warnings: Vec<String>,
}

fn sorted_json_paths(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir)
        .map_err(|err| anyhow!("Failed to read glossary directory '{}': {}", dir.display(), err))?;
    let mut paths = Vec::new();
    for entry in entries {
        let entry =
            entry.map_err(|err| anyhow!("Failed to read glossary directory entry: {}", err))?;
        let path = entry.path();
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        if path.is_file() && is_json {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

fn parse_glossary_file(path: &Path) -> Result<(String, Value)> {
    let category = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .map(|stem| stem.trim().to_string())
        .filter(|stem| !stem.is_empty())
        .ok_or_else(|| anyhow!("Glossary file '{}' has no usable name", path.display()))?;
    let raw = fs::read_to_string(path)
        .map_err(|err| anyhow!("Failed to read glossary file '{}': {}", path.display(), err))?;
    let value = serde_json::from_str::<Value>(&raw)
        .map_err(|err| anyhow!("Failed to parse glossary file '{}': {}", path.display(), err))?;
    Ok((category, value))
}

/// Loads every `*.json` in `dir`. Problems become warnings; the result is
/// always usable, possibly empty.
pub fn load_style_glossary(dir: &Path) -> GlossaryLoad {
    let mut load = GlossaryLoad::default();

    if !dir.exists() {
        let message = format!("Style glossary directory '{}' not found", dir.display());
        warn!("{}", message);
        load.warnings.push(message);
        return load;
    }

    let paths = match sorted_json_paths(dir) {
        Ok(paths) => paths,
        Err(err) => {
            warn!("{}", err);
            load.warnings.push(err.to_string());
            return load;
        }
    };

    for path in paths {
        match parse_glossary_file(&path) {
            Ok((category, value)) => {
                debug!("Loaded glossary category '{}'", category);
                load.glossary.categories.insert(category, value);
            }
            Err(err) => {
                warn!("Skipping glossary file: {}", err);
                load.warnings.push(err.to_string());
            }
        }
    }

    if load.glossary.is_empty() {
        let message = format!("Style glossary directory '{}' has no JSON data", dir.display());
        warn!("{}", message);
        load.warnings.push(message);
    } else {
        info!("Loaded {} glossary category(ies)", load.glossary.len());
    }
    load
}

/// Loads the glossary on first use and keeps it until invalidated.
#[derive(Debug)]
pub struct GlossaryCache {
    dir: PathBuf,
    cached: Mutex<Option<Arc<GlossaryLoad>>>,
}

impl GlossaryCache {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            cached: Mutex::new(None),
        }
    }

    pub fn get(&self) -> Arc<GlossaryLoad> {
        let mut cached = self.cached.lock();
        if let Some(load) = cached.as_ref() {
            return Arc::clone(load);
        }
        let load = Arc::new(load_style_glossary(&self.dir));
        *cached = Some(Arc::clone(&load));
        load
    }

    pub fn invalidate(&self) {
        self.cached.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "valeria-glossary-{}-{}-{}",
            label,
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn loads_categories_from_file_stems_and_skips_bad_files() {
        let dir = scratch_dir("load");
        fs::write(dir.join("fashion.json"), r#"{"outfits": ["trench coat"]}"#).unwrap();
        fs::write(dir.join("lighting.json"), r#"["golden hour", "rim light"]"#).unwrap();
        fs::write(dir.join("broken.json"), "{ not json").unwrap();
        fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let load = load_style_glossary(&dir);
        let names: Vec<&str> = load.glossary.category_names().collect();
        assert_eq!(names, vec!["fashion", "lighting"]);
        assert_eq!(load.warnings.len(), 1);
        assert!(load.glossary.to_prompt_block().contains("trench coat"));

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_directory_degrades_to_empty_glossary() {
        let dir = std::env::temp_dir().join("valeria-glossary-does-not-exist");
        let load = load_style_glossary(&dir);

        assert!(load.glossary.is_empty());
        assert_eq!(load.warnings.len(), 1);
        assert_eq!(load.glossary.to_prompt_block(), GLOSSARY_PLACEHOLDER);
        assert_eq!(glossary_prompt_block(None), GLOSSARY_PLACEHOLDER);
    }

    #[test]
    fn cache_reloads_only_after_invalidation() {
        let dir = scratch_dir("cache");
        fs::write(dir.join("poses.json"), r#"["contrapposto"]"#).unwrap();
        let cache = GlossaryCache::new(dir.clone());
        assert_eq!(cache.get().glossary.len(), 1);

        fs::write(dir.join("places.json"), r#"["Paris"]"#).unwrap();
        assert_eq!(cache.get().glossary.len(), 1);

        cache.invalidate();
        assert_eq!(cache.get().glossary.len(), 2);

        fs::remove_dir_all(&dir).ok();
    }
}
