use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

#[derive(Debug, Clone)]
pub struct Capture {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
}

/// 查找目录下的 *.bin 采集文件，按路径排序
pub fn scan_captures(dir: &Path) -> Result<Vec<Capture>> {
    let mut captures = Vec::new();

    if !dir.exists() {
        debug!("Replay directory does not exist: {:?}", dir);
        return Ok(captures);
    }

    for entry in WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let is_bin = path
            .extension()
            .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case("bin"))
            .unwrap_or(false);
        if !is_bin {
            continue;
        }
        let metadata = entry
            .metadata()
            .with_context(|| format!("failed to stat {}", path.display()))?;
        captures.push(Capture {
            path: path.to_path_buf(),
            name: path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("unknown")
                .to_string(),
            size: metadata.len(),
        });
    }

    Ok(captures)
}

/// 按固定大小分块读取一个采集文件
pub struct CaptureReader {
    file: tokio::fs::File,
    chunk_size: usize,
}

impl CaptureReader {
    pub async fn open(path: &Path, chunk_size: usize) -> Result<Self> {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        Ok(Self {
            file,
            chunk_size: chunk_size.max(1),
        })
    }

    pub async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        use tokio::io::AsyncReadExt;

        let mut buffer = vec![0u8; self.chunk_size];
        let n = self.file.read(&mut buffer).await?;
        if n == 0 {
            return Ok(None);
        }
        buffer.truncate(n);
        Ok(Some(buffer))
    }
}
