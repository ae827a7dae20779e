//! Almacén de ficheros subidos.
//!
//! `LocalBlobStore` guarda los bytes bajo un directorio raíz y los identifica
//! con URLs `file://`; sólo resuelve URLs que caen dentro de esa raíz.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub url: String,
    pub path: String,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, path: &str, bytes: &[u8]) -> Result<StoredBlob>;

    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;

    async fn delete(&self, url: &str) -> Result<()>;
}

pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    /// Crea el directorio raíz si no existe.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        tokio::fs::create_dir_all(root.as_ref()).await?;
        let root = tokio::fs::canonicalize(root.as_ref()).await?;
        Ok(Self { root })
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let relative = Path::new(relative);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::invalid(format!(
                "ruta de fichero no permitida: {}",
                relative.display()
            )));
        }
        Ok(self.root.join(relative))
    }

    fn path_from_url(&self, url: &str) -> Result<PathBuf> {
        let parsed = Url::parse(url).map_err(Error::storage)?;
        if parsed.scheme() != "file" {
            return Err(Error::storage(format!("esquema no soportado: {}", parsed.scheme())));
        }
        let path = parsed
            .to_file_path()
            .map_err(|_| Error::storage(format!("URL de fichero inválida: {url}")))?;
        let relative = path
            .strip_prefix(&self.root)
            .map_err(|_| Error::storage(format!("URL fuera del almacén: {url}")))?;
        self.resolve(&relative.to_string_lossy())
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, path: &str, bytes: &[u8]) -> Result<StoredBlob> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, bytes).await?;
        debug!("Guardados {} bytes en {}", bytes.len(), target.display());

        let url = Url::from_file_path(&target)
            .map_err(|_| Error::storage(format!("ruta no absoluta: {}", target.display())))?;
        Ok(StoredBlob {
            url: url.to_string(),
            path: path.to_string(),
        })
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let path = self.path_from_url(url)?;
        Ok(tokio::fs::read(path).await?)
    }

    async fn delete(&self, url: &str) -> Result<()> {
        let path = self.path_from_url(url)?;
        Ok(tokio::fs::remove_file(path).await?)
    }
}
