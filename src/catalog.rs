//! 카탈로그 (서버가 제공하는 파일 목록)
//!
//! 목록 페이로드는 줄 단위 `"<이름> - <크기> Bytes"` 텍스트

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::io::AsyncRead;

use crate::{Error, Result};

/// 기본 제공 디렉터리
pub const DEFAULT_CATALOG_DIR: &str = "Downloadable Files";

/// 카탈로그 항목
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub name: String,
    pub size: u64,
}

impl CatalogEntry {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }
}

/// 목록 텍스트 생성
pub fn render_listing(entries: &[CatalogEntry]) -> String {
    let mut text = String::new();
    for entry in entries {
        let _ = writeln!(text, "{} - {} Bytes", entry.name, entry.size);
    }
    text
}

/// 목록 텍스트 파싱
///
/// 형식에 맞지 않는 줄은 건너뜀
pub fn parse_listing(text: &str) -> Vec<CatalogEntry> {
    text.lines()
        .filter_map(|line| {
            let (name, size) = line.trim_end().rsplit_once(" - ")?;
            let size = size.strip_suffix(" Bytes")?.parse().ok()?;
            Some(CatalogEntry::new(name, size))
        })
        .collect()
}

/// 파일 읽기 소스
pub struct ArtifactSource {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub len: u64,
}

impl std::fmt::Debug for ArtifactSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactSource")
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

/// 카탈로그 제공자
pub trait Catalog: Send + Sync {
    /// 현재 제공 중인 파일 목록
    fn entries(&self) -> Result<Vec<CatalogEntry>>;

    /// 파일을 순차 읽기 소스로 열기. 없으면 `UnknownArtifact`
    fn open(&self, name: &str) -> Result<ArtifactSource>;
}

/// 이름이 단일 파일 이름인지 확인 (경로 탈출 방지)
fn is_plain_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

/// 디렉터리 기반 카탈로그
#[derive(Debug, Clone)]
pub struct DirectoryCatalog {
    root: PathBuf,
}

impl DirectoryCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Default for DirectoryCatalog {
    fn default() -> Self {
        Self::new(DEFAULT_CATALOG_DIR)
    }
}

impl Catalog for DirectoryCatalog {
    fn entries(&self) -> Result<Vec<CatalogEntry>> {
        let mut entries = Vec::new();

        for dir_entry in std::fs::read_dir(&self.root)? {
            let dir_entry = dir_entry?;
            let metadata = dir_entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            // UTF-8이 아닌 이름은 요청 패킷으로 표현할 수 없음
            if let Ok(name) = dir_entry.file_name().into_string() {
                entries.push(CatalogEntry::new(name, metadata.len()));
            }
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn open(&self, name: &str) -> Result<ArtifactSource> {
        let unknown = || Error::UnknownArtifact {
            name: name.to_owned(),
        };

        if !is_plain_name(name) {
            return Err(unknown());
        }

        let file = match std::fs::File::open(self.root.join(name)) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(unknown()),
            Err(e) => return Err(e.into()),
        };

        let metadata = file.metadata()?;
        if !metadata.is_file() {
            return Err(unknown());
        }

        Ok(ArtifactSource {
            reader: Box::new(tokio::fs::File::from_std(file)),
            len: metadata.len(),
        })
    }
}

/// 메모리 카탈로그
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    artifacts: BTreeMap<String, Bytes>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 파일 추가
    pub fn with(mut self, name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.artifacts.insert(name.into(), data.into());
        self
    }
}

impl Catalog for MemoryCatalog {
    fn entries(&self) -> Result<Vec<CatalogEntry>> {
        Ok(self
            .artifacts
            .iter()
            .map(|(name, data)| CatalogEntry::new(name.clone(), data.len() as u64))
            .collect())
    }

    fn open(&self, name: &str) -> Result<ArtifactSource> {
        let data = self
            .artifacts
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownArtifact {
                name: name.to_owned(),
            })?;

        Ok(ArtifactSource {
            len: data.len() as u64,
            reader: Box::new(std::io::Cursor::new(data)),
        })
    }
}
