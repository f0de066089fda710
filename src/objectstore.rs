use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Re-hosting target for generated images. Stored objects are served back
/// through `GET /objects/{name}`, so `put_object` returns a URL a client
/// can actually fetch, relative to the gateway unless a public base is
/// configured.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store the bytes and return a client-reachable URL.
    async fn put_object(&self, bytes: Vec<u8>, suggested_name: &str) -> Result<String, String>;
    async fn get_object(&self, name: &str) -> Result<Option<Vec<u8>>, String>;
}

fn valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['/', '\\']) && !name.contains("..")
}

#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    inner: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_object(&self, bytes: Vec<u8>, suggested_name: &str) -> Result<String, String> {
        if !valid_name(suggested_name) {
            return Err(format!("invalid object name {suggested_name}"));
        }
        let mut guard = self.inner.write().await;
        guard.insert(suggested_name.to_string(), bytes);
        Ok(format!("/objects/{suggested_name}"))
    }

    async fn get_object(&self, name: &str) -> Result<Option<Vec<u8>>, String> {
        let guard = self.inner.read().await;
        Ok(guard.get(name).cloned())
    }
}

/// Filesystem-backed store for the sqlite deployment. Objects land under
/// one flat directory and survive restarts.
pub struct FsObjectStore {
    dir: PathBuf,
    public_base: String,
}

impl FsObjectStore {
    pub fn new(dir: impl Into<PathBuf>, public_base: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            public_base: public_base.into(),
        }
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put_object(&self, bytes: Vec<u8>, suggested_name: &str) -> Result<String, String> {
        if !valid_name(suggested_name) {
            return Err(format!("invalid object name {suggested_name}"));
        }
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|err| err.to_string())?;
        tokio::fs::write(self.dir.join(suggested_name), bytes)
            .await
            .map_err(|err| err.to_string())?;
        Ok(format!(
            "{}/objects/{suggested_name}",
            self.public_base.trim_end_matches('/')
        ))
    }

    async fn get_object(&self, name: &str) -> Result<Option<Vec<u8>>, String> {
        if !valid_name(name) {
            return Ok(None);
        }
        match tokio::fs::read(self.dir.join(name)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.to_string()),
        }
    }
}
