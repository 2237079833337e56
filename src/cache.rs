use anyhow::{Context, Result};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

// Advisory gzip-wrapped JSON snapshots under cache/<networkId>/. A cold
// start without them still converges within one ingestion cycle.

fn cache_path(root: &Path, network_id: &str, name: &str) -> PathBuf {
    root.join(network_id).join(format!("{}.json.gz", name))
}

pub fn save<T: Serialize>(root: &Path, network_id: &str, name: &str, value: &T) -> Result<()> {
    let path = cache_path(root, network_id, name);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating {}", dir.display()))?;
    }

    let json = serde_json::to_vec(value).context("serializing cache")?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    let compressed = encoder.finish()?;

    // Write-then-rename so a crash mid-save never leaves a torn file.
    let tmp = path.with_extension("gz.tmp");
    std::fs::write(&tmp, &compressed)
        .with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, &path)
        .with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

// A missing cache file is an empty cache, not an error.
pub fn load<T: DeserializeOwned>(root: &Path, network_id: &str, name: &str) -> Result<Option<T>> {
    let path = cache_path(root, network_id, name);
    let file = match File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("opening {}", path.display())),
    };

    let mut json = Vec::new();
    GzDecoder::new(file)
        .read_to_end(&mut json)
        .with_context(|| format!("decompressing {}", path.display()))?;
    let value = serde_json::from_slice(&json)
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FeedEntity;
    use compact_str::CompactString;
    use std::collections::HashMap;

    fn temp_root(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("led-rails-cache-{}", label));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_save_and_restore_entity_map() {
        let root = temp_root("roundtrip");
        let mut entities: HashMap<CompactString, FeedEntity> = HashMap::new();
        entities.insert(
            "59721".into(),
            FeedEntity {
                id: "59721".into(),
                ..Default::default()
            },
        );

        save(&root, "AT", "entities", &entities).unwrap();
        let restored: HashMap<CompactString, FeedEntity> =
            load(&root, "AT", "entities").unwrap().unwrap();
        assert_eq!(entities, restored);
    }

    #[test]
    fn test_load_missing_is_none() {
        let root = temp_root("missing");
        let restored: Option<HashMap<CompactString, FeedEntity>> =
            load(&root, "AT", "entities").unwrap();
        assert!(restored.is_none());
    }

    #[test]
    fn test_load_corrupt_is_error() {
        let root = temp_root("corrupt");
        let dir = root.join("AT");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("entities.json.gz"), b"not gzip at all").unwrap();
        let result: Result<Option<HashMap<CompactString, FeedEntity>>> =
            load(&root, "AT", "entities");
        assert!(result.is_err());
    }

    #[test]
    fn test_save_is_atomic_no_tmp_left_behind() {
        let root = temp_root("atomic");
        save(&root, "AT", "trainPairs", &Vec::<u32>::new()).unwrap();
        let entries: Vec<_> = std::fs::read_dir(root.join("AT"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(entries, vec!["trainPairs.json.gz"]);
    }
}
