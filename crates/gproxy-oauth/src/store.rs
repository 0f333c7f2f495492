//! On-disk persistence of per-account OAuth credentials.
//!
//! Record shape normalization happens on read so that repeated reads of the
//! same file yield equal structs regardless of which legacy key variant the
//! file was written with.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum TokenStoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid token record json: {0}")]
    Json(#[from] serde_json::Error),
}

pub type TokenStoreResult<T> = Result<T, TokenStoreError>;

/// Identifies one on-disk credential file and the provider it belongs to.
#[derive(Debug, Clone)]
pub struct TokenDescriptor {
    pub provider: String,
    pub path: PathBuf,
}

impl TokenDescriptor {
    pub fn new(provider: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            provider: provider.into(),
            path: path.into(),
        }
    }
}

/// Normalized OAuth token record. Legacy key variants (`AccessToken`,
/// `apiKey`, `expired`, `expiry_date`, `expiry_timestamp`) are tolerated on
/// read and always written back out under the canonical names.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StoredTokenRecord {
    #[serde(default, alias = "AccessToken")]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default, alias = "apiKey")]
    pub api_key: Option<String>,
    #[serde(default, alias = "expiry_date", alias = "expiry_timestamp", alias = "expired")]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub disabled: Option<bool>,
    #[serde(default)]
    pub protected_models: Option<Vec<String>>,
    /// `"static"` means the lifecycle never refreshes this token.
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default, alias = "noRefresh")]
    pub norefresh: Option<bool>,
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl StoredTokenRecord {
    pub fn is_static_alias(&self) -> bool {
        self.alias.as_deref() == Some("static")
    }
}

/// Flattens the Gemini-family nested schema `{ token: {...}, project_id, ... }`
/// into a single top-level object before normal deserialization, preserving
/// top-level metadata that already exists.
fn flatten_gemini_shape(mut value: serde_json::Value) -> serde_json::Value {
    let Some(obj) = value.as_object_mut() else {
        return value;
    };
    let Some(serde_json::Value::Object(nested)) = obj.remove("token") else {
        return value;
    };
    for (key, nested_value) in nested {
        obj.entry(key).or_insert(nested_value);
    }
    value
}

pub fn read(path: &Path) -> TokenStoreResult<Option<StoredTokenRecord>> {
    let raw = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let value: serde_json::Value = serde_json::from_slice(&raw)?;
    let flattened = flatten_gemini_shape(value);
    let record: StoredTokenRecord = serde_json::from_value(flattened)?;
    Ok(Some(record))
}

pub fn write(path: &Path, record: &StoredTokenRecord) -> TokenStoreResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let body = serde_json::to_vec_pretty(record)?;
    let tmp_path = path.with_extension(format!(
        "{}.tmp",
        path.extension().and_then(|e| e.to_str()).unwrap_or("json")
    ));
    std::fs::write(&tmp_path, &body)?;
    set_owner_only_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Copies the current file to `<path>.<epoch>.bak`. Never deletes the
/// primary; returns `None` if the primary does not exist.
pub fn backup(path: &Path) -> TokenStoreResult<Option<PathBuf>> {
    if !path.exists() {
        return Ok(None);
    }
    let epoch = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let backup_path = path.with_extension(format!(
        "{}.{epoch}.bak",
        path.extension().and_then(|e| e.to_str()).unwrap_or("json")
    ));
    std::fs::copy(path, &backup_path)?;
    Ok(Some(backup_path))
}

/// Restores a backup over `target`, best-effort unlinking the backup file
/// afterwards.
pub fn restore(backup_path: &Path, target: &Path) -> TokenStoreResult<()> {
    std::fs::rename(backup_path, target).or_else(|_| {
        std::fs::copy(backup_path, target)?;
        let _ = std::fs::remove_file(backup_path);
        Ok::<_, std::io::Error>(())
    })?;
    Ok(())
}

pub fn mtime(path: &Path) -> Option<i64> {
    let meta = std::fs::metadata(path).ok()?;
    let modified = meta.modified().ok()?;
    let millis = modified
        .duration_since(std::time::UNIX_EPOCH)
        .ok()?
        .as_millis();
    i64::try_from(millis).ok()
}

#[cfg(unix)]
fn set_owner_only_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn set_owner_only_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_keys_are_aliased_on_read() {
        let json = serde_json::json!({
            "AccessToken": "tok",
            "apiKey": "key",
            "expiry_date": 123,
        });
        let record: StoredTokenRecord = serde_json::from_value(json).unwrap();
        assert_eq!(record.access_token.as_deref(), Some("tok"));
        assert_eq!(record.api_key.as_deref(), Some("key"));
        assert_eq!(record.expires_at, Some(123));
    }

    #[test]
    fn norefresh_accepts_both_legacy_key_names() {
        let snake: StoredTokenRecord =
            serde_json::from_value(serde_json::json!({ "norefresh": true })).unwrap();
        assert_eq!(snake.norefresh, Some(true));

        let camel: StoredTokenRecord =
            serde_json::from_value(serde_json::json!({ "noRefresh": true })).unwrap();
        assert_eq!(camel.norefresh, Some(true));
    }

    #[test]
    fn gemini_nested_token_shape_is_flattened() {
        let json = serde_json::json!({
            "token": { "access_token": "tok", "refresh_token": "ref" },
            "project_id": "proj-1",
            "disabled": false,
        });
        let flattened = flatten_gemini_shape(json);
        let record: StoredTokenRecord = serde_json::from_value(flattened).unwrap();
        assert_eq!(record.access_token.as_deref(), Some("tok"));
        assert_eq!(record.project_id.as_deref(), Some("proj-1"));
        assert_eq!(record.disabled, Some(false));
    }

    #[test]
    fn read_write_roundtrip_is_idempotent() {
        let dir = std::env::temp_dir().join(format!("gproxy-oauth-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("token.json");

        let record = StoredTokenRecord {
            access_token: Some("tok".to_string()),
            refresh_token: Some("ref".to_string()),
            expires_at: Some(1000),
            ..Default::default()
        };
        write(&path, &record).unwrap();
        let read_back = read(&path).unwrap().unwrap();
        assert_eq!(read_back, record);

        write(&path, &record).unwrap();
        let read_again = read(&path).unwrap().unwrap();
        assert_eq!(read_again, read_back);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_file_reads_as_none() {
        let path = std::env::temp_dir().join("gproxy-oauth-does-not-exist.json");
        assert!(read(&path).unwrap().is_none());
    }
}
