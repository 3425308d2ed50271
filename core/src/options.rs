use crate::drive::{parse_letters, DriveLetter, DEFAULT_CANDIDATE_LETTERS, MAX_SETTLE_TIMEOUT, RESERVED_LETTERS};
use crate::CompactError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactOptions {
    pub diskpart_path: PathBuf,
    pub defrag_path: PathBuf,
    pub defrag_flags: String,
    /// 1-based, as diskpart counts partitions.
    pub partition_index: u32,
    pub candidate_letters: String,
    /// Upper bound on waiting for the assigned letter after attach.
    pub settle_timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Detach the image again when a step fails after it was attached.
    pub cleanup_on_failure: bool,
    pub pause_on_exit: bool,
}

impl Default for CompactOptions {
    fn default() -> Self {
        Self {
            diskpart_path: PathBuf::from("diskpart.exe"),
            defrag_path: default_defrag_path(),
            defrag_flags: "/U /V /X".to_string(),
            partition_index: 1,
            candidate_letters: DEFAULT_CANDIDATE_LETTERS.to_string(),
            settle_timeout_secs: 30,
            poll_interval_ms: 500,
            cleanup_on_failure: false,
            pause_on_exit: true,
        }
    }
}

fn default_defrag_path() -> PathBuf {
    let root = std::env::var_os("SystemRoot").unwrap_or_else(|| "C:\\Windows".into());
    let mut path = PathBuf::from(root);
    path.push("System32");
    path.push("Defrag.exe");
    path
}

impl CompactOptions {
    /// `<config dir>/vhdcompact/config.json`, if the platform has a config dir.
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("vhdcompact").join(CONFIG_FILE_NAME))
    }

    pub fn from_file(path: &Path) -> Result<Self, CompactError> {
        let contents = std::fs::read_to_string(path)?;
        let options: Self = serde_json::from_str(&contents)?;
        tracing::debug!("Loaded options from {}", path.display());
        Ok(options)
    }

    /// Explicit file if given, else the default file when it exists, else
    /// built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, CompactError> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => match Self::default_config_path() {
                Some(path) if path.is_file() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn validate(&self) -> Result<(), CompactError> {
        if self.diskpart_path.as_os_str().is_empty() {
            return Err(CompactError::Configuration("diskpart_path is empty".into()));
        }
        if self.defrag_path.as_os_str().is_empty() {
            return Err(CompactError::Configuration("defrag_path is empty".into()));
        }
        if self.partition_index == 0 {
            return Err(CompactError::Configuration(
                "partition_index starts at 1".into(),
            ));
        }
        if self.settle_timeout_secs > MAX_SETTLE_TIMEOUT.as_secs() {
            return Err(CompactError::Configuration(format!(
                "settle_timeout_secs must be at most {}",
                MAX_SETTLE_TIMEOUT.as_secs()
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(CompactError::Configuration(
                "poll_interval_ms must be positive".into(),
            ));
        }
        self.candidate_pool().map(|_| ())
    }

    pub fn candidate_pool(&self) -> Result<Vec<DriveLetter>, CompactError> {
        let pool = parse_letters(&self.candidate_letters)
            .map_err(|e| CompactError::Configuration(format!("candidate_letters: {}", e)))?;
        if pool.is_empty() {
            return Err(CompactError::Configuration("candidate_letters is empty".into()));
        }
        if let Some(reserved) = pool.iter().find(|l| RESERVED_LETTERS.contains(l.as_char())) {
            return Err(CompactError::Configuration(format!(
                "candidate_letters contains reserved letter {}",
                reserved
            )));
        }
        Ok(pool)
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_secs(self.settle_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Command line handed to defrag, e.g. `D: /U /V /X`.
    pub fn defrag_args(&self, letter: DriveLetter) -> String {
        format!("{}: {}", letter, self.defrag_flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let options = CompactOptions::default();
        options.validate().unwrap();
        assert!(options.defrag_path.ends_with("Defrag.exe"));
        assert_eq!(options.settle_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn defrag_args_use_drive_specifier() {
        let options = CompactOptions::default();
        let letter = DriveLetter::new('h').unwrap();
        assert_eq!(options.defrag_args(letter), "H: /U /V /X");
    }

    #[test]
    fn reserved_letters_are_rejected() {
        let options = CompactOptions {
            candidate_letters: "CDE".into(),
            ..Default::default()
        };
        assert!(matches!(options.validate(), Err(CompactError::Configuration(_))));
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let options = CompactOptions {
            poll_interval_ms: 0,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn oversized_settle_timeout_is_rejected() {
        let options = CompactOptions {
            settle_timeout_secs: u64::MAX,
            ..Default::default()
        };
        assert!(matches!(options.validate(), Err(CompactError::Configuration(_))));

        let options = CompactOptions {
            settle_timeout_secs: MAX_SETTLE_TIMEOUT.as_secs(),
            ..Default::default()
        };
        options.validate().unwrap();
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "settle_timeout_secs": 5, "cleanup_on_failure": true }}"#).unwrap();

        let options = CompactOptions::load(Some(file.path())).unwrap();
        assert_eq!(options.settle_timeout_secs, 5);
        assert!(options.cleanup_on_failure);
        assert_eq!(options.partition_index, 1);
        assert_eq!(options.defrag_flags, "/U /V /X");
    }

    #[test]
    fn malformed_file_is_a_serialization_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        let err = CompactOptions::from_file(file.path()).unwrap_err();
        assert!(matches!(err, CompactError::SerializationError(_)));
    }
}
