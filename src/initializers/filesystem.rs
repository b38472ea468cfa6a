//! Directory layout initializer
//!
//! Ensures every required directory exists under the base path with the
//! configured permission bits.

use crate::error::{ConfigurationError, InitError, ResourceError};
use crate::initializer::{settings, Initializer, Lifecycle, RetryPolicy};
use crate::initializers::validated;
use log::{debug, info, warn};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use toml::Table;

/// Outcome of checking one required directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionCheck {
    /// Directory exists with the expected mode
    Ok,
    /// Nothing exists at the path
    Missing,
    /// Something other than a directory exists at the path
    WrongType,
    /// Directory exists with different permission bits
    WrongMode { expected: u32, actual: u32 },
}

#[derive(Debug, Clone)]
struct FileSystemSettings {
    base_path: PathBuf,
    permissions: u32,
    required_dirs: Vec<String>,
}

impl FileSystemSettings {
    fn parse(config: &Table) -> Result<Self, ConfigurationError> {
        let base_path = PathBuf::from(settings::required_str(config, "base_path")?);
        let permissions = settings::permissions(config, "permissions", 0o755)?;
        let required_dirs = settings::string_list(config, "required_dirs")?
            .ok_or_else(|| ConfigurationError::Missing("required_dirs".to_string()))?;
        if required_dirs.is_empty() {
            return Err(ConfigurationError::Empty("required_dirs".to_string()));
        }

        for (index, dir) in required_dirs.iter().enumerate() {
            let relative = Path::new(dir)
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
            if !relative {
                return Err(ConfigurationError::InvalidValue {
                    field: format!("required_dirs[{}]", index),
                    reason: format!("'{}' must be a relative path without '..'", dir),
                });
            }
        }

        Ok(Self {
            base_path,
            permissions,
            required_dirs,
        })
    }
}

/// Create and remove a scratch file in `path`
fn check_writable(path: &Path) -> io::Result<()> {
    tempfile::Builder::new()
        .prefix(".preflight-")
        .tempfile_in(path)
        .map(drop)
}

fn mode_of(metadata: &fs::Metadata) -> u32 {
    metadata.permissions().mode() & 0o7777
}

fn check(path: &Path, expected: u32) -> io::Result<PermissionCheck> {
    match fs::metadata(path) {
        Ok(metadata) if !metadata.is_dir() => Ok(PermissionCheck::WrongType),
        Ok(metadata) => {
            let actual = mode_of(&metadata);
            if actual == expected {
                Ok(PermissionCheck::Ok)
            } else {
                Ok(PermissionCheck::WrongMode { expected, actual })
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(PermissionCheck::Missing),
        Err(e) => Err(e),
    }
}

/// Creates the required directory tree
pub struct FileSystemInitializer {
    lifecycle: Lifecycle,
    config: Table,
    settings: Option<FileSystemSettings>,
}

impl FileSystemInitializer {
    pub fn new(name: &str, config: Table) -> Self {
        Self {
            lifecycle: Lifecycle::new(name, "filesystem"),
            config,
            settings: None,
        }
    }

    /// Check one required directory against the configured mode
    ///
    /// # Arguments
    /// * `dir` - Directory relative to the base path
    ///
    /// # Errors
    ///
    /// `NotValidated` before validation, `ResourceError::Io` when the path cannot
    /// be inspected.
    pub fn verify_permissions(&self, dir: &str) -> Result<PermissionCheck, InitError> {
        let settings = validated(&self.lifecycle, &self.settings)?;
        let path = settings.base_path.join(dir);
        check(&path, settings.permissions)
            .map_err(|source| ResourceError::Io { path, source }.into())
    }

    /// Absolute path of a required directory
    pub fn path_of(&self, dir: &str) -> Option<PathBuf> {
        self.settings
            .as_ref()
            .map(|settings| settings.base_path.join(dir))
    }

    fn ensure_dir(
        lifecycle: &mut Lifecycle,
        path: &Path,
        mode: u32,
    ) -> Result<bool, ResourceError> {
        let io_error = |source: io::Error| ResourceError::Io {
            path: path.to_path_buf(),
            source,
        };

        let created = match check(path, mode).map_err(io_error)? {
            PermissionCheck::Ok => false,
            PermissionCheck::WrongType => {
                return Err(ResourceError::NotADirectory(path.to_path_buf()))
            }
            PermissionCheck::WrongMode { expected, actual } => {
                warn!(
                    "{}: correcting mode of {} from {:o} to {:o}",
                    lifecycle.name(),
                    path.display(),
                    actual,
                    expected
                );
                lifecycle.status_mut().add_warning(format!(
                    "corrected permissions of '{}' from {:o} to {:o}",
                    path.display(),
                    actual,
                    expected
                ));
                false
            }
            PermissionCheck::Missing => {
                fs::create_dir_all(path).map_err(io_error)?;
                debug!("{}: created {}", lifecycle.name(), path.display());
                true
            }
        };

        // Applied explicitly so the process umask cannot narrow the mode
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(io_error)?;

        let actual = fs::metadata(path).map(|m| mode_of(&m)).map_err(io_error)?;
        if actual != mode {
            return Err(ResourceError::PermissionMismatch {
                path: path.to_path_buf(),
                expected: mode,
                actual,
            });
        }
        Ok(created)
    }
}

impl Initializer for FileSystemInitializer {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn lifecycle_mut(&mut self) -> &mut Lifecycle {
        &mut self.lifecycle
    }

    fn kind(&self) -> &'static str {
        "filesystem"
    }

    fn validate_configuration(&mut self) -> Result<(), ConfigurationError> {
        let parsed = FileSystemSettings::parse(&self.config);
        self.settings = parsed.as_ref().ok().cloned();
        self.lifecycle.record_validation(parsed.map(|_| ()))
    }

    /// Verify that the base path is an existing, writable directory
    fn test_connection(&mut self) -> Result<bool, InitError> {
        let settings = validated(&self.lifecycle, &self.settings)?.clone();
        let base = settings.base_path.as_path();
        let result = self.lifecycle.connect_with_retry(
            &base.display().to_string(),
            RetryPolicy::once(),
            || match fs::metadata(base) {
                Ok(metadata) if !metadata.is_dir() => Err("exists but is not a directory".to_string()),
                Ok(_) => check_writable(base).map_err(|e| format!("not writable: {}", e)),
                Err(e) => Err(e.to_string()),
            },
        );
        Ok(result.is_ok())
    }

    fn perform_initialization(&mut self) -> Result<(), InitError> {
        let settings = validated(&self.lifecycle, &self.settings)?.clone();

        self.lifecycle.perform(|lifecycle| {
            let mut created = Vec::new();
            for dir in &settings.required_dirs {
                let path = settings.base_path.join(dir);
                if Self::ensure_dir(lifecycle, &path, settings.permissions)? {
                    created.push(dir.clone());
                }
            }
            info!(
                "{}: {} required directories ready under {} ({} created)",
                lifecycle.name(),
                settings.required_dirs.len(),
                settings.base_path.display(),
                created.len()
            );
            lifecycle.status_mut().add_data("created", created);
            lifecycle
                .status_mut()
                .add_data("base_path", settings.base_path.display().to_string());
            Ok(())
        })
    }

    fn reset(&mut self) {
        self.lifecycle.reset();
    }
}
