use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;

/// Maps the external catalog's blueprint ids to local catalog item ids.
/// Called once per chunk with every blueprint id in it; ids missing from
/// the result are unresolvable and their rows are skipped.
pub trait CatalogResolver: Send + Sync {
    fn resolve(&self, blueprint_ids: &[i64]) -> Result<HashMap<i64, i64>>;
}

/// Local catalog item ids are the blueprint ids themselves.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityResolver;

impl CatalogResolver for IdentityResolver {
    fn resolve(&self, blueprint_ids: &[i64]) -> Result<HashMap<i64, i64>> {
        Ok(blueprint_ids.iter().map(|id| (*id, *id)).collect())
    }
}

/// Fixed mapping, typically loaded from a JSON object
/// `{"<blueprint id>": <catalog item id>, ...}`.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    mapping: HashMap<i64, i64>,
}

impl StaticResolver {
    pub fn new(mapping: HashMap<i64, i64>) -> Self {
        Self { mapping }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read blueprint map: {:?}", path))?;
        let raw: HashMap<String, i64> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse blueprint map: {:?}", path))?;
        let mapping = raw
            .into_iter()
            .map(|(k, v)| {
                k.trim()
                    .parse::<i64>()
                    .map(|k| (k, v))
                    .with_context(|| format!("Invalid blueprint id in map: {:?}", k))
            })
            .collect::<Result<HashMap<_, _>>>()?;
        Ok(Self { mapping })
    }
}

impl CatalogResolver for StaticResolver {
    fn resolve(&self, blueprint_ids: &[i64]) -> Result<HashMap<i64, i64>> {
        Ok(blueprint_ids
            .iter()
            .filter_map(|id| self.mapping.get(id).map(|catalog_id| (*id, *catalog_id)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_resolver_drops_unknown_ids() {
        let resolver = StaticResolver::new(HashMap::from([(1, 100), (2, 200)]));
        let resolved = resolver.resolve(&[1, 3]).unwrap();
        assert_eq!(resolved, HashMap::from([(1, 100)]));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("map.json");
        std::fs::write(&path, r#"{"10": 1000, " 11 ": 1100}"#).unwrap();

        let resolver = StaticResolver::load(&path).unwrap();
        assert_eq!(resolver.resolve(&[10, 11, 12]).unwrap().len(), 2);

        std::fs::write(&path, r#"{"ten": 1000}"#).unwrap();
        assert!(StaticResolver::load(&path).is_err());
    }
}
