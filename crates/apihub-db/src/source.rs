use std::path::{Path, PathBuf};

use apihub_common::{Error, Result};
use ring::digest::{SHA256, digest};
use serde::Serialize;
use tracing::debug;

/// Extension of migration files.
pub const MIGRATION_EXTENSION: &str = ".sql";

/// Migrations shipped with the service, compiled into the binary as
/// `(file name, content)` pairs.
pub const SHIPPED_MIGRATIONS: &[(&str, &str)] = &[
    (
        "20240115_001_create_users.sql",
        include_str!("../migrations/20240115_001_create_users.sql"),
    ),
    (
        "20240115_002_users_profile_fields.sql",
        include_str!("../migrations/20240115_002_users_profile_fields.sql"),
    ),
];

/// A migration discovered on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationDefinition {
    /// File name without extension, e.g. `20240115_001_create_users`.
    pub version: String,
    pub description: String,
    /// Hex SHA-256 of the file content.
    pub checksum: String,
    #[serde(skip)]
    pub content: String,
}

impl MigrationDefinition {
    pub fn new(version: impl Into<String>, content: impl Into<String>) -> Self {
        let version = version.into();
        let content = content.into();
        let description =
            parse_description(&content).unwrap_or_else(|| format!("Migration {version}"));
        let checksum = checksum(content.as_bytes());
        Self {
            version,
            description,
            checksum,
            content,
        }
    }
}

/// Where migration definitions come from.
#[derive(Debug, Clone)]
pub enum MigrationSource {
    /// `*.sql` files in a directory, read at discovery time.
    Directory(PathBuf),
    /// File name and content pairs built into the binary.
    Embedded(&'static [(&'static str, &'static str)]),
}

impl MigrationSource {
    pub fn directory(dir: impl Into<PathBuf>) -> Self {
        Self::Directory(dir.into())
    }

    /// The migrations shipped with the service.
    pub fn shipped() -> Self {
        Self::Embedded(SHIPPED_MIGRATIONS)
    }

    /// Human-readable origin for logs and summaries.
    pub fn location(&self) -> String {
        match self {
            Self::Directory(dir) => dir.display().to_string(),
            Self::Embedded(_) => "built-in".to_string(),
        }
    }

    /// List every migration in version order. Entries whose names do not
    /// match `<yyyymmdd>_<nnn>_<slug>.sql` are skipped. Any read failure
    /// aborts discovery.
    pub fn discover(&self) -> Result<Vec<MigrationDefinition>> {
        let definitions = match self {
            Self::Directory(dir) => read_directory(dir)?,
            Self::Embedded(files) => files
                .iter()
                .filter_map(|(name, content)| {
                    parse_file_name(name).map(|version| MigrationDefinition::new(version, *content))
                })
                .collect(),
        };

        let definitions = ordered(definitions);
        debug!(
            "discovered {} migration(s) in {}",
            definitions.len(),
            self.location()
        );
        Ok(definitions)
    }
}

fn read_directory(dir: &Path) -> Result<Vec<MigrationDefinition>> {
    let source_error = |path: &Path, message: String| Error::SourceRead {
        path: path.to_path_buf(),
        message,
    };

    let entries = std::fs::read_dir(dir).map_err(|e| source_error(dir, e.to_string()))?;

    let mut definitions = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| source_error(dir, e.to_string()))?;
        let path = entry.path();
        let file_name = entry.file_name();
        let Some(version) = file_name.to_str().and_then(parse_file_name) else {
            debug!("skipping non-migration entry {}", path.display());
            continue;
        };
        if !path.is_file() {
            debug!("skipping directory {}", path.display());
            continue;
        }

        let bytes = std::fs::read(&path).map_err(|e| source_error(&path, e.to_string()))?;
        let content = String::from_utf8(bytes)
            .map_err(|_| source_error(&path, "migration is not valid UTF-8".into()))?;
        definitions.push(MigrationDefinition::new(version, content));
    }
    Ok(definitions)
}

/// Sort by version string. This is the application order.
pub fn ordered(mut definitions: Vec<MigrationDefinition>) -> Vec<MigrationDefinition> {
    definitions.sort_by(|a, b| a.version.cmp(&b.version));
    definitions
}

/// Version encoded in a migration file name, or `None` when the name is not
/// `<8 digits>_<3 digits>_<lowercase slug>.sql`.
pub fn parse_file_name(file_name: &str) -> Option<&str> {
    let version = file_name.strip_suffix(MIGRATION_EXTENSION)?;
    let mut parts = version.splitn(3, '_');
    let date = parts.next()?;
    let seq = parts.next()?;
    let slug = parts.next()?;

    let all_digits = |s: &str, len: usize| s.len() == len && s.bytes().all(|b| b.is_ascii_digit());
    let valid_slug = !slug.is_empty()
        && slug
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_');

    (all_digits(date, 8) && all_digits(seq, 3) && valid_slug).then_some(version)
}

/// Text of the first `-- description: <text>` line (key matched
/// case-insensitively). Blank descriptions count as absent.
pub fn parse_description(content: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let comment = line.trim_start().strip_prefix("--")?.trim_start();
        let (key, value) = comment.split_once(':')?;
        let value = value.trim();
        (key.eq_ignore_ascii_case("description") && !value.is_empty()).then(|| value.to_string())
    })
}

/// Hex-encoded SHA-256 of `content`.
pub fn checksum(content: &[u8]) -> String {
    digest(&SHA256, content)
        .as_ref()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
