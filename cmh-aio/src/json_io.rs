// cmh-aio/src/json_io.rs
use std::path::Path;

use cmh_common::error::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

pub fn write_json_sync<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    debug!("Sync writing JSON to: {}", path.display());
    let json_bytes = serde_json::to_vec_pretty(data)?;
    crate::fs::atomic_write_file(path, &json_bytes)
}

pub fn read_json_sync<T: DeserializeOwned>(path: &Path) -> Result<T> {
    debug!("Sync reading JSON from: {}", path.display());
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);
    Ok(serde_json::from_reader(reader)?)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn written_json_reads_back_and_replaces_old_content() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("manifest.json");
        let mut data = BTreeMap::new();
        data.insert("module".to_string(), "fmt".to_string());

        write_json_sync(&path, &data).unwrap();
        let back: BTreeMap<String, String> = read_json_sync(&path).unwrap();
        assert_eq!(back, data);

        write_json_sync(&path, &BTreeMap::<String, String>::new()).unwrap();
        let back: BTreeMap<String, String> = read_json_sync(&path).unwrap();
        assert!(back.is_empty());
    }

    #[test]
    fn malformed_json_is_a_json_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("broken.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = read_json_sync::<serde_json::Value>(&path).unwrap_err();
        assert!(matches!(err, cmh_common::CmhError::Json(_)));
    }
}
